use crate::errors::ReplayError;
use serde::{Deserialize, Serialize};

/// Stage of one fixture's walk through a test invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Pending,
    Filtering,
    Running,
    Analyzing,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Filtering => "FILTERING",
            Self::Running => "RUNNING",
            Self::Analyzing => "ANALYZING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "FILTERING" => Some(Self::Filtering),
            "RUNNING" => Some(Self::Running),
            "ANALYZING" => Some(Self::Analyzing),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Outcome of a single parameter set's RUNNING stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamStatus {
    Pending,
    Running,
    Recorded,
    Failed,
}

impl ParamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Recorded => "recorded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "recorded" => Some(Self::Recorded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamProgress {
    pub name: String,
    pub status: ParamStatus,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    pub stage: Stage,
    pub params: Vec<ParamProgress>,
    pub failure_reason: Option<String>,
}

impl Lifecycle {
    pub fn new(param_names: &[String]) -> Self {
        Self {
            stage: Stage::Pending,
            params: param_names
                .iter()
                .map(|name| ParamProgress {
                    name: name.clone(),
                    status: ParamStatus::Pending,
                    failure_reason: None,
                })
                .collect(),
            failure_reason: None,
        }
    }

    pub fn transition(&mut self, next: Stage) -> Result<(), ReplayError> {
        validate_transition(self.stage, next)?;
        self.stage = next;
        Ok(())
    }

    /// Filtering failures block every later stage for this fixture.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ReplayError> {
        self.transition(Stage::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    fn param_mut(&mut self, name: &str) -> Result<&mut ParamProgress, ReplayError> {
        self.params
            .iter_mut()
            .find(|param| param.name == name)
            .ok_or_else(|| ReplayError::InvalidConfig(format!("unknown param set `{name}`")))
    }

    pub fn start_param(&mut self, name: &str) -> Result<(), ReplayError> {
        if self.stage != Stage::Running {
            return Err(ReplayError::InvalidConfig(format!(
                "param `{name}` can only start in RUNNING, not {}",
                self.stage.as_str()
            )));
        }
        let param = self.param_mut(name)?;
        if param.status != ParamStatus::Pending {
            return Err(ReplayError::InvalidConfig(format!(
                "param `{name}` already ran"
            )));
        }
        param.status = ParamStatus::Running;
        Ok(())
    }

    pub fn finish_param(&mut self, name: &str, result: Result<(), String>) -> Result<(), ReplayError> {
        let param = self.param_mut(name)?;
        if param.status != ParamStatus::Running {
            return Err(ReplayError::InvalidConfig(format!(
                "param `{name}` is not running"
            )));
        }
        match result {
            Ok(()) => param.status = ParamStatus::Recorded,
            Err(reason) => {
                param.status = ParamStatus::Failed;
                param.failure_reason = Some(reason);
            }
        }
        Ok(())
    }

    /// Params whose RUNNING stage produced output; only these are analyzed.
    pub fn analyzable_params(&self) -> Vec<String> {
        self.params
            .iter()
            .filter(|param| param.status == ParamStatus::Recorded)
            .map(|param| param.name.clone())
            .collect()
    }

    pub fn any_param_failed(&self) -> bool {
        self.params
            .iter()
            .any(|param| param.status == ParamStatus::Failed)
    }
}

pub fn validate_transition(from: Stage, to: Stage) -> Result<(), ReplayError> {
    use Stage as S;

    let allowed = match from {
        S::Pending => matches!(to, S::Filtering | S::Analyzing | S::Failed),
        S::Filtering => matches!(to, S::Running | S::Failed),
        S::Running => matches!(to, S::Analyzing | S::Failed),
        S::Analyzing => matches!(to, S::Done | S::Failed),
        S::Done | S::Failed => false,
    };

    if !allowed {
        return Err(ReplayError::InvalidConfig(format!(
            "illegal transition: {} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}
