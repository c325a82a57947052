//! Job description as submitted in a launch request.
//!
//! Only the fields the reservation pipeline reads are modelled; everything else
//! in the launch document is ignored during deserialization.

use serde::{Deserialize, Serialize};

use crate::id::ExternalJobId;

/// A parsed job-launch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    /// Invocation id of the job, used to locate its storage row.
    #[serde(rename = "uuid")]
    pub invocation_id: ExternalJobId,

    /// Submitting user, for log context.
    #[serde(rename = "username", default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,

    /// Steps in declaration order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl JobDescription {
    pub fn new(invocation_id: impl Into<ExternalJobId>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            submitter: None,
            steps: Vec::new(),
        }
    }

    pub fn with_submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }
}

/// One step of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub component: Component,
}

impl Step {
    /// A step that declares no core limit.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// A step capped at `cores` CPU cores.
    pub fn with_max_cpu_cores(cores: f64) -> Self {
        Self {
            component: Component {
                container: Container {
                    max_cpu_cores: Some(cores),
                },
            },
        }
    }

    /// Declared core limit, if any. `0` is reported as-is; callers treat it as unset.
    pub fn max_cpu_cores(&self) -> Option<f64> {
        self.component.container.max_cpu_cores
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(default)]
    pub container: Container,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_cores: Option<f64>,
}
