//! Stored entitlement document.
//!
//! Identity rows keep their entitlement fields in a JSON document. An old
//! write path re-wrapped the whole document inside itself on every save, so
//! legacy rows look like `{"tier": "free", "entitlement": {"tier": "pro", ...}}`.
//! Reads flatten any depth of nesting; writes always emit the flat v2 shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{Entitlement, EntitlementStatus, Level, Provider, Tier};

pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Key under which the legacy writer nested the previous document.
const NESTED_KEY: &str = "entitlement";
const MAX_DEPTH: usize = 16;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatDocument {
    tier: String,
    level: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription_provider: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadDocument {
    pub entitlement: Entitlement,
    /// The stored row is not in the current flat shape
    pub malformed: bool,
}

pub fn read_document(value: &Value, schema_version: i32) -> ReadDocument {
    let mut malformed = schema_version < CURRENT_SCHEMA_VERSION;

    let root = match value {
        Value::Object(map) => map,
        Value::Null => {
            return ReadDocument {
                entitlement: Entitlement::default(),
                malformed,
            };
        }
        _ => {
            return ReadDocument {
                entitlement: Entitlement::default(),
                malformed: true,
            };
        }
    };

    let mut layers: Vec<&Map<String, Value>> = vec![root];
    let mut current = root;
    while let Some(Value::Object(inner)) = current.get(NESTED_KEY) {
        if layers.len() >= MAX_DEPTH {
            break;
        }
        layers.push(inner);
        current = inner;
    }
    if layers.len() > 1 || root.contains_key(NESTED_KEY) {
        malformed = true;
    }

    // Outer layers were written last; deeper layers only fill gaps
    let field = |key: &str, malformed: &mut bool| -> Option<String> {
        for layer in &layers {
            match layer.get(key) {
                Some(Value::String(s)) => return Some(s.clone()),
                Some(Value::Null) | None => continue,
                Some(_) => *malformed = true,
            }
        }
        None
    };

    let tier = field("tier", &mut malformed).map(|t| Tier::normalize(&t));
    let level = field("level", &mut malformed).map(|l| Level::normalize(&l));
    let status = field("status", &mut malformed).map(|s| EntitlementStatus::normalize(&s));
    let subscription_provider = field("subscriptionProvider", &mut malformed)
        .and_then(|p| Provider::normalize(&p));

    let tier = tier.unwrap_or_default();
    let derived_level = Level::from_tier(tier);
    if level.is_some_and(|l| l != derived_level) {
        // level is derived; a disagreeing stored value is corrupt
        malformed = true;
    }

    ReadDocument {
        entitlement: Entitlement {
            tier,
            level: derived_level,
            status: status.unwrap_or_default(),
            subscription_provider,
        },
        malformed,
    }
}

pub fn write_document(entitlement: &Entitlement) -> Value {
    let doc = FlatDocument {
        tier: entitlement.tier.as_str().to_string(),
        level: entitlement.level.as_str().to_string(),
        status: entitlement.status.as_str().to_string(),
        subscription_provider: entitlement
            .subscription_provider
            .map(|p| p.as_str().to_string()),
    };
    serde_json::to_value(doc).unwrap_or(Value::Null)
}
