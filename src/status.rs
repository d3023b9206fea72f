//! Named boolean conditions carried by both custom resources, and the
//! read-modify-write helper every status change goes through.
use chrono::Utc;
use kube::{ResourceExt, core::object::HasStatus};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    store::{Store, StoreObject},
};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    Pending,
    Progressing,
    Invalid,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(b: bool) -> Self {
        if b { ConditionStatus::True } else { ConditionStatus::False }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Overall state shown next to the conditions
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Pending,
    Progressing,
    Invalid,
    Running,
}

/// Operations on a condition list.
pub trait Conditions {
    fn get(&self, type_: ConditionType) -> Option<&Condition>;

    /// Sets a condition. The transition time only moves when the status flips,
    /// so setting the same value twice leaves the list untouched.
    fn set(&mut self, type_: ConditionType, value: bool, reason: &str, message: &str);

    fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    fn is_false(&self, type_: ConditionType) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::False)
    }
}

impl Conditions for Vec<Condition> {
    fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.iter().find(|c| c.type_ == type_)
    }

    fn set(&mut self, type_: ConditionType, value: bool, reason: &str, message: &str) {
        let status = ConditionStatus::from(value);
        let reason = (!reason.is_empty()).then(|| reason.to_string());
        let message = (!message.is_empty()).then(|| message.to_string());
        match self.iter_mut().find(|c| c.type_ == type_) {
            Some(c) => {
                if c.status != status {
                    c.status = status;
                    c.last_transition_time = Some(Utc::now().to_rfc3339());
                }
                c.reason = reason;
                c.message = message;
            }
            None => self.push(Condition {
                type_,
                status,
                reason,
                message,
                last_transition_time: Some(Utc::now().to_rfc3339()),
            }),
        }
    }
}

/// Fields shared by the status of every managed kind.
pub trait ManagedStatus: Default + Clone + PartialEq + Send + Sync {
    fn conditions(&self) -> &Vec<Condition>;
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn revision_hash(&self) -> Option<&str>;
    /// Stores a new hash and bumps the revision counter.
    fn set_revision(&mut self, hash: String);
    fn set_phase(&mut self, phase: Phase, reason: Option<String>);
    /// Fills in empty maps so later writes compare against a stable shape.
    fn ensure_defaults(&mut self) {}
}

/// Persists `status` for `obj` unless it is deep-equal to what is stored.
///
/// After writing, the object is re-read so later stages work against the
/// latest stored version.
pub async fn write_status<K, S>(store: &S, obj: &mut K, status: K::Status) -> Result<()>
where
    K: StoreObject + HasStatus,
    K::Status: ManagedStatus,
    S: Store,
{
    if obj.status() == Some(&status) {
        return Ok(());
    }
    *obj.status_mut() = Some(status);
    store.update_status(obj).await?;

    let namespace = obj.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    match store.get::<K>(&namespace, &obj.name_any()).await? {
        Some(fresh) => {
            *obj = fresh;
            Ok(())
        }
        None => Err(Error::Conflict(format!(
            "{} {} vanished during status write",
            K::kind(&()),
            obj.name_any()
        ))),
    }
}
