//! Mirror and queue forwarding policies
//!
//! A policy names a set of targets (mirror destinations or queue topics) and
//! owns rules selecting which agents, ports and directions feed them.

pub mod store;
pub mod validate;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::{PolicyStore, TargetPool};

/// What a policy's targets address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// `ip:port` destinations reached over raw sockets
    Mirror,
    /// Message-queue topic names
    Queue,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Mirror => "mirror",
            PolicyKind::Queue => "queue",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic direction a rule selects; encoded as 0, 1 and -1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Direction {
    Ingress,
    Egress,
    Both,
}

impl Direction {
    pub fn as_i32(self) -> i32 {
        match self {
            Direction::Ingress => 0,
            Direction::Egress => 1,
            Direction::Both => -1,
        }
    }
}

impl TryFrom<i32> for Direction {
    type Error = PolicyError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Direction::Ingress),
            1 => Ok(Direction::Egress),
            -1 => Ok(Direction::Both),
            other => Err(PolicyError::InvalidDirection(other)),
        }
    }
}

impl From<Direction> for i32 {
    fn from(direction: Direction) -> Self {
        direction.as_i32()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Port value matching every port
pub const ANY_PORT: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Agent IP the rule applies to
    pub source: String,
    pub port: i32,
    pub direction: Direction,
    /// Inherited from the owning policy whenever the policy set changes
    #[serde(default, alias = "distAddress", alias = "targetQueue")]
    pub targets: Vec<String>,
}

impl Rule {
    pub fn new(source: impl Into<String>, port: i32, direction: Direction) -> Self {
        Self {
            source: source.into(),
            port,
            direction,
            targets: Vec::new(),
        }
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            source: self.source.clone(),
            port: self.port,
            direction: self.direction,
        }
    }

    /// Management ID, `<port>_<direction>_<source>`
    pub fn id(&self) -> String {
        self.key().to_string()
    }
}

/// Identity of a rule within a policy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub source: String,
    pub port: i32,
    pub direction: Direction,
}

impl RuleKey {
    pub fn matches(&self, rule: &Rule) -> bool {
        rule.source == self.source && rule.port == self.port && rule.direction == self.direction
    }

    /// Parse a management rule ID
    pub fn parse(id: &str) -> Result<Self, PolicyError> {
        let invalid = || PolicyError::InvalidRuleId(id.to_string());
        let mut parts = id.splitn(3, '_');
        let port = parts
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .ok_or_else(invalid)?;
        let direction = parts
            .next()
            .and_then(|d| d.parse::<i32>().ok())
            .ok_or_else(invalid)?;
        let source = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        Ok(Self {
            source: source.to_string(),
            port,
            direction: Direction::try_from(direction)?,
        })
    }
}

impl From<&Rule> for RuleKey {
    fn from(rule: &Rule) -> Self {
        rule.key()
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.port, self.direction, self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub policy_id: String,
    #[serde(alias = "targetAddress", alias = "targetQueue")]
    pub targets: Vec<String>,
    #[serde(with = "enable_flag")]
    pub enable: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Policy {
    pub fn new(policy_id: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            policy_id: policy_id.into(),
            targets,
            enable: true,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// `enable` is persisted as 0/1; booleans are accepted on read
mod enable_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(enable: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*enable))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Flag {
            Bool(bool),
            Int(i64),
        }

        Ok(match Flag::deserialize(deserializer)? {
            Flag::Bool(enable) => enable,
            Flag::Int(enable) => enable != 0,
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("target {0} must split with ':'")]
    MissingPortSeparator(String),

    #[error("can not parse ip {0}")]
    InvalidIp(String),

    #[error("port {0} is illegal, must be a number between 0 and 65535")]
    InvalidTargetPort(String),

    #[error("port {0} is illegal, must be between -1 and 65535")]
    PortOutOfRange(i32),

    #[error("direction {0} is error, must be 0 1 or -1")]
    InvalidDirection(i32),

    #[error("queue name {0} must be character number and _")]
    InvalidQueueName(String),

    #[error("Policy id is blank")]
    BlankPolicyId,

    #[error("already have this policy {0}")]
    DuplicatePolicy(String),

    #[error("already has same rule.")]
    DuplicateRule,

    #[error("can not find policy {0}")]
    UnknownPolicy(String),

    #[error("can not find matched rule {rule} for policy {policy_id}")]
    UnknownRule { policy_id: String, rule: String },

    #[error("malformed rule id {0}")]
    InvalidRuleId(String),

    #[error("failed to persist policies to {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error("failed to load policies from {path}: {reason}")]
    Load { path: String, reason: String },
}

/// `(result, message)` reply for the management surface; a negative result is a rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiReply {
    pub result: i64,
    pub message: String,
}

impl ApiReply {
    pub fn new(result: Result<usize, PolicyError>, success: &str) -> Self {
        match result {
            Ok(n) => Self {
                result: i64::try_from(n).unwrap_or(i64::MAX),
                message: success.to_string(),
            },
            Err(e) => Self {
                result: -1,
                message: e.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result >= 0
    }
}
