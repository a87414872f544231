use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemKind {
    #[serde(rename = "self")]
    SelfSystem,
    Host,
    File,
    Template,
}

impl SystemKind {
    /// Kinds that run a live collector and expose a history feed.
    pub fn is_live(&self) -> bool {
        matches!(self, SystemKind::SelfSystem | SystemKind::Host)
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, SystemKind::File | SystemKind::Template)
    }
}

/// Status of a monitored system as shown in the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Ok,
    Checking,
    Pending,
    Imported,
    Online,
    Offline,
    Removed,
    Error,
    AuthReq,
}

impl SystemStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SystemStatus::Ok => "OK",
            SystemStatus::Checking => "Checking",
            SystemStatus::Pending => "Pending",
            SystemStatus::Imported => "Imported",
            SystemStatus::Online => "Online",
            SystemStatus::Offline => "Offline",
            SystemStatus::Removed => "Removed",
            SystemStatus::Error => "Error",
            SystemStatus::AuthReq => "Authentication required",
        }
    }

    /// Reachable again after being unreachable or locked out.
    pub fn is_recovery_from(&self, previous: SystemStatus) -> bool {
        matches!(self, SystemStatus::Online | SystemStatus::Ok)
            && matches!(
                previous,
                SystemStatus::AuthReq | SystemStatus::Offline | SystemStatus::Error
            )
    }
}
