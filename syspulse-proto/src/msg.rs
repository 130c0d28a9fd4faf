use serde::{Deserialize, Serialize};

/// Privileged host operation exposed over `POST /system/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Restart,
    Shutdown,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Restart => "restart",
            ControlAction::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResp {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResp {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_action_names() {
        assert_eq!(ControlAction::Shutdown.to_string(), "shutdown");
        assert_eq!(
            serde_json::to_string(&ControlAction::Restart).unwrap(),
            r#""restart""#
        );
    }
}
