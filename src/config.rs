use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: String,
    /// Spool directory for incoming messages; system temp dir when unset
    pub tempdir: Option<String>,
    pub address_compliance_checker: String,
    pub address_compliance_fail_action: ComplianceFailAction,
    pub address_compliance_fail_message: String,
    pub prependaddedheaders: String,
    pub spamstatusheader: bool,
    pub debuginfoheader: bool,
    pub suspectidheader: bool,
    pub logtemplate: String,
    pub trashdir: String,
    pub trashlog: bool,
    pub remove_tmpfiles_on_error: bool,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// What to do with a message whose envelope addresses fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceFailAction {
    #[default]
    Defer,
    Reject,
    Discard,
}

impl ComplianceFailAction {
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "defer" => ComplianceFailAction::Defer,
            "reject" => ComplianceFailAction::Reject,
            "discard" => ComplianceFailAction::Discard,
            other => {
                log::warn!("Unknown address_compliance_fail_action '{other}', using defer");
                ComplianceFailAction::Defer
            }
        }
    }
}

impl<'de> Deserialize<'de> for ComplianceFailAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::parse_lenient(&value))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: "/var/run/scan-milter.sock".to_string(),
            tempdir: None,
            address_compliance_checker: "Default".to_string(),
            address_compliance_fail_action: ComplianceFailAction::Defer,
            address_compliance_fail_message: "invalid sender or recipient address".to_string(),
            prependaddedheaders: "X-Scan-".to_string(),
            spamstatusheader: true,
            debuginfoheader: false,
            suspectidheader: true,
            logtemplate: "Suspect ${id} from=${from_address} to=${to_address} size=${size} \
                          spam=${spam} virus=${virus} blocked=${blocked} scantime=${scantime}"
                .to_string(),
            trashdir: String::new(),
            trashlog: false,
            remove_tmpfiles_on_error: true,
            logging: Some(LoggingConfig {
                level: "info".to_string(),
            }),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn trash_enabled(&self) -> bool {
        !self.trashdir.trim().is_empty()
    }
}
