use chrono::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, strum::Display,
)]
pub enum ConditionType {
    Ready,
    KubeConfigValid,
    HelmReconcileFailed,
    #[serde(rename = "RBACReady")]
    #[strum(serialize = "RBACReady")]
    RbacReady,
    DeletionScheduled,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, strum::Display,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        match value {
            true => Self::True,
            false => Self::False,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(type_: ConditionType, status: impl Into<ConditionStatus>) -> Self {
        Self {
            type_,
            status: status.into(),
            last_transition_time: Utc::now(),
            reason: None,
            message: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// Same status, reason and message. Transition time is ignored.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StatusConditions {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl StatusConditions {
    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_).map(Condition::is_true).unwrap_or(false)
    }

    /// Inserts or replaces the condition of the same type. The transition time
    /// only moves when the status actually changes.
    pub fn set(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    pub fn remove(&mut self, type_: ConditionType) {
        self.conditions.retain(|c| c.type_ != type_);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn set_keeps_transition_time_when_status_unchanged() {
        let mut conditions = StatusConditions::default();
        let mut first = Condition::new(ConditionType::Ready, true);
        first.last_transition_time = Utc::now() - Duration::hours(1);
        let original_time = first.last_transition_time;
        conditions.set(first);

        conditions.set(Condition::new(ConditionType::Ready, true).with_message("still ready"));

        let ready = conditions.get(ConditionType::Ready).unwrap();
        assert_eq!(ready.last_transition_time, original_time);
        assert_eq!(ready.message.as_deref(), Some("still ready"));
        assert_eq!(conditions.conditions.len(), 1);
    }

    #[test]
    fn set_moves_transition_time_on_status_change() {
        let mut conditions = StatusConditions::default();
        let mut first = Condition::new(ConditionType::Ready, true);
        first.last_transition_time = Utc::now() - Duration::hours(1);
        let original_time = first.last_transition_time;
        conditions.set(first);

        conditions.set(Condition::new(ConditionType::Ready, false));

        let ready = conditions.get(ConditionType::Ready).unwrap();
        assert!(ready.last_transition_time > original_time);
        assert!(!conditions.is_true(ConditionType::Ready));
    }

    #[test]
    fn rbac_ready_serializes_with_acronym() {
        let condition = Condition::new(ConditionType::RbacReady, true);
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "RBACReady");
        assert_eq!(json["status"], "True");
        assert_eq!(ConditionType::RbacReady.to_string(), "RBACReady");
    }
}
