//! Sessions and trials
//!
//! A [`Session`] is one subject's trials for one task on one day. Sessions are
//! validated once on construction and never mutated afterwards, so they can be
//! shared across scheduler workers without locking.
//!
//! ```rust
//! use choicefit::session::{Session, SessionKey, TaskKind, Trial};
//!
//! let key = SessionKey::new("S01", 1, TaskKind::Discounting);
//! let session = Session::new(
//!     key,
//!     vec![Trial::discounting(10.0, 0.0, 20.0, 30.0, 1)],
//! )?;
//! assert_eq!(session.len(), 1);
//! # Ok::<(), choicefit::Error>(())
//! ```

mod table;

pub use table::{columns, RejectedSession, SessionTable};

use crate::model::ModelSpec;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Experimental task a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Smaller-sooner vs larger-later choices
    Discounting,
    /// Fixed vs risky/ambiguous lottery choices
    RiskAmbiguity,
}

impl TaskKind {
    /// All task kinds, in output column order.
    pub const ALL: [Self; 2] = [Self::Discounting, Self::RiskAmbiguity];

    /// Stable string identifier used in stores and column names.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Discounting => "discounting",
            Self::RiskAmbiguity => "risk_ambiguity",
        }
    }

    /// Choice model fitted for this task.
    #[must_use]
    pub fn model(&self) -> &'static ModelSpec {
        match self {
            Self::Discounting => &crate::model::DISCOUNTING,
            Self::RiskAmbiguity => &crate::model::RISK_AMBIGUITY,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discounting" => Ok(Self::Discounting),
            "risk_ambiguity" => Ok(Self::RiskAmbiguity),
            other => Err(Error::InvalidInput(format!("unknown task '{other}'"))),
        }
    }
}

/// (subject, day) key shared by both tasks; the join and store key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    /// Subject identifier
    pub subject: String,
    /// Session day
    pub day: u32,
}

impl UnitKey {
    /// Create a unit key.
    #[must_use]
    pub fn new(subject: impl Into<String>, day: u32) -> Self {
        Self {
            subject: subject.into(),
            day,
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/day{}", self.subject, self.day)
    }
}

/// (subject, day, task) key identifying one estimation job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Subject identifier
    pub subject: String,
    /// Session day
    pub day: u32,
    /// Task
    pub task: TaskKind,
}

impl SessionKey {
    /// Create a session key.
    #[must_use]
    pub fn new(subject: impl Into<String>, day: u32, task: TaskKind) -> Self {
        Self {
            subject: subject.into(),
            day,
            task,
        }
    }

    /// The task-independent (subject, day) part of the key.
    #[must_use]
    pub fn unit(&self) -> UnitKey {
        UnitKey::new(self.subject.clone(), self.day)
    }

    fn malformed(&self, reason: impl Into<String>) -> Error {
        Error::MalformedSession {
            subject: self.subject.clone(),
            day: self.day,
            task: self.task.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/day{}/{}", self.subject, self.day, self.task)
    }
}

/// One discounting decision: smaller-sooner vs larger-later.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiscountingTrial {
    /// Smaller-sooner amount
    pub ss_amount: f64,
    /// Smaller-sooner delay
    pub ss_delay: f64,
    /// Larger-later amount
    pub ll_amount: f64,
    /// Larger-later delay
    pub ll_delay: f64,
    /// 1 if the larger-later option was chosen
    pub choice: u8,
}

/// One risk/ambiguity decision: fixed amount vs variable lottery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskAmbiguityTrial {
    /// Certain amount
    pub fixed_amount: f64,
    /// Lottery amount
    pub variable_amount: f64,
    /// Winning probability of the lottery
    pub probability: f64,
    /// Fraction of the probability that is hidden (0 = pure risk)
    pub ambiguity: f64,
    /// 1 if the variable option was chosen
    pub choice: u8,
}

/// A single decision event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Trial {
    /// Discounting task trial
    Discounting(DiscountingTrial),
    /// Risk/ambiguity task trial
    RiskAmbiguity(RiskAmbiguityTrial),
}

impl Trial {
    /// Build a discounting trial.
    #[must_use]
    pub const fn discounting(
        ss_amount: f64,
        ss_delay: f64,
        ll_amount: f64,
        ll_delay: f64,
        choice: u8,
    ) -> Self {
        Self::Discounting(DiscountingTrial {
            ss_amount,
            ss_delay,
            ll_amount,
            ll_delay,
            choice,
        })
    }

    /// Build a risk/ambiguity trial.
    #[must_use]
    pub const fn risk_ambiguity(
        fixed_amount: f64,
        variable_amount: f64,
        probability: f64,
        ambiguity: f64,
        choice: u8,
    ) -> Self {
        Self::RiskAmbiguity(RiskAmbiguityTrial {
            fixed_amount,
            variable_amount,
            probability,
            ambiguity,
            choice,
        })
    }

    /// Task this trial belongs to.
    #[must_use]
    pub const fn task(&self) -> TaskKind {
        match self {
            Self::Discounting(_) => TaskKind::Discounting,
            Self::RiskAmbiguity(_) => TaskKind::RiskAmbiguity,
        }
    }

    /// Observed binary choice.
    #[must_use]
    pub const fn choice(&self) -> u8 {
        match self {
            Self::Discounting(t) => t.choice,
            Self::RiskAmbiguity(t) => t.choice,
        }
    }

    /// Check the trial invariants.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.choice() > 1 {
            return Err(format!("choice {} outside {{0, 1}}", self.choice()));
        }
        let design: [(&str, f64); 4] = match self {
            Self::Discounting(t) => [
                ("ss_amount", t.ss_amount),
                ("ss_delay", t.ss_delay),
                ("ll_amount", t.ll_amount),
                ("ll_delay", t.ll_delay),
            ],
            Self::RiskAmbiguity(t) => [
                ("fixed_amount", t.fixed_amount),
                ("variable_amount", t.variable_amount),
                ("probability", t.probability),
                ("ambiguity", t.ambiguity),
            ],
        };
        for (name, value) in design {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} = {value} must be finite and non-negative"));
            }
        }
        if let Self::RiskAmbiguity(t) = self {
            if t.probability > 1.0 {
                return Err(format!("probability = {} exceeds 1", t.probability));
            }
            if t.ambiguity > 1.0 {
                return Err(format!("ambiguity = {} exceeds 1", t.ambiguity));
            }
        }
        Ok(())
    }
}

/// A validated, immutable sequence of trials for one (subject, day, task).
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    key: SessionKey,
    trials: Arc<[Trial]>,
}

impl Session {
    /// Validate trials and build a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSession`] if the session is empty, a trial
    /// belongs to a different task, or any trial invariant is violated.
    pub fn new(key: SessionKey, trials: Vec<Trial>) -> Result<Self> {
        if trials.is_empty() {
            return Err(key.malformed("session has no trials"));
        }
        for (index, trial) in trials.iter().enumerate() {
            if trial.task() != key.task {
                return Err(key.malformed(format!(
                    "trial {index} is a {} trial",
                    trial.task()
                )));
            }
            trial
                .validate()
                .map_err(|reason| key.malformed(format!("trial {index}: {reason}")))?;
        }
        Ok(Self {
            key,
            trials: trials.into(),
        })
    }

    /// Session key.
    #[must_use]
    pub const fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Task of this session.
    #[must_use]
    pub const fn task(&self) -> TaskKind {
        self.key.task
    }

    /// Trials in presentation order.
    #[must_use]
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    /// Number of trials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    /// Always false for a constructed session; kept for API symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }
}
