//! Serialization of notifications for the queue.
//!
//! A payload carries the notification's type identifier, the envelope
//! metadata and the notification state. Types are registered up front;
//! encoding or decoding an unregistered type fails with `InvalidPayload`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::notification::{Envelope, Notification, NotificationId};
use crate::{Error, Result};

type Encoder = Arc<dyn Fn(&dyn Any) -> Result<Value> + Send + Sync>;
type Decoder = Arc<dyn Fn(Value) -> Result<Arc<dyn Notification>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    encode: Encoder,
    decode: Decoder,
}

/// Wire shape of a serialized notification.
#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<NotificationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay_ms: Option<u64>,
    #[serde(default)]
    state: Map<String, Value>,
}

/// Type registry plus encode/decode of envelopes.
#[derive(Default)]
pub struct NotificationCodec {
    types: RwLock<HashMap<String, Registration>>,
}

impl NotificationCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `N` encodable and decodable.
    ///
    /// State fields equal to `N::default()` are left out of payloads and
    /// restored from the default on decode.
    pub fn register<N>(&self)
    where
        N: Notification + Serialize + DeserializeOwned + Default,
    {
        let type_name = N::default().type_name().to_string();

        let encode: Encoder = Arc::new(|any: &dyn Any| {
            let notification = any
                .downcast_ref::<N>()
                .ok_or_else(|| Error::invalid_payload("notification type mismatch"))?;
            let state = serde_json::to_value(notification)?;
            let defaults = serde_json::to_value(N::default())?;
            Ok(strip_defaults(state, &defaults))
        });

        let decode: Decoder = Arc::new(|state: Value| {
            let mut merged = serde_json::to_value(N::default())?;
            overlay(&mut merged, state);
            let notification: N = serde_json::from_value(merged)
                .map_err(|e| Error::invalid_payload(format!("cannot restore state: {}", e)))?;
            let notification: Arc<dyn Notification> = Arc::new(notification);
            Ok(notification)
        });

        self.types
            .write()
            .insert(type_name, Registration { encode, decode });
    }

    /// Make `N` encodable through [`Notification::snapshot`] and decodable
    /// through `restore`.
    ///
    /// Keyed by the Rust type path, so `N` must keep the default `type_name`.
    pub fn register_snapshot<N, F>(&self, restore: F)
    where
        N: Notification,
        F: Fn(Value) -> Result<N> + Send + Sync + 'static,
    {
        let encode: Encoder = Arc::new(|any: &dyn Any| {
            any.downcast_ref::<N>()
                .ok_or_else(|| Error::invalid_payload("notification type mismatch"))?
                .snapshot()
        });

        let decode: Decoder = Arc::new(move |state: Value| {
            let notification: Arc<dyn Notification> = Arc::new(restore(state)?);
            Ok(notification)
        });

        self.types.write().insert(
            std::any::type_name::<N>().to_string(),
            Registration { encode, decode },
        );
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.types.read().contains_key(type_name)
    }

    /// Serialize an envelope.
    pub fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let type_name = envelope.type_name();
        let registration = self.types.read().get(type_name).cloned().ok_or_else(|| {
            Error::invalid_payload(format!("'{}' is not a registered notification type", type_name))
        })?;
        let any: &dyn Any = envelope.notification();
        let state = (registration.encode)(any)?;

        let state = match state {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let payload = Payload {
            type_name: type_name.to_string(),
            id: envelope.id().cloned(),
            locale: envelope.locale().map(str::to_string),
            queue: envelope.queue().map(str::to_string),
            connection: envelope.connection().map(str::to_string),
            delay_ms: envelope.delay().map(|d| d.as_millis() as u64),
            state,
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    /// Reconstruct an envelope from serialized bytes.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Envelope> {
        let payload: Payload = serde_json::from_slice(bytes)
            .map_err(|e| Error::invalid_payload(format!("undecodable notification: {}", e)))?;

        let registration = self
            .types
            .read()
            .get(&payload.type_name)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_payload(format!(
                    "'{}' is not a registered notification type",
                    payload.type_name
                ))
            })?;

        let notification = (registration.decode)(Value::Object(payload.state))?;
        let mut envelope = Envelope::from_arc(notification);
        if let Some(id) = payload.id {
            envelope = envelope.with_id(id);
        }
        if let Some(locale) = payload.locale {
            envelope = envelope.with_locale(locale);
        }
        if let Some(queue) = payload.queue {
            envelope = envelope.on_queue(queue);
        }
        if let Some(connection) = payload.connection {
            envelope = envelope.on_connection(connection);
        }
        if let Some(ms) = payload.delay_ms {
            envelope = envelope.with_delay(Duration::from_millis(ms));
        }
        Ok(envelope)
    }

    /// Serialize to base64 text, the form used inside job arguments.
    pub fn serialize_base64(&self, envelope: &Envelope) -> Result<String> {
        Ok(BASE64.encode(self.serialize(envelope)?))
    }

    pub fn deserialize_base64(&self, encoded: &str) -> Result<Envelope> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::invalid_payload(format!("invalid base64: {}", e)))?;
        self.deserialize(&bytes)
    }
}

fn strip_defaults(state: Value, defaults: &Value) -> Value {
    match (state, defaults) {
        (Value::Object(mut fields), Value::Object(default_fields)) => {
            fields.retain(|key, value| default_fields.get(key) != Some(value));
            Value::Object(fields)
        }
        (state, _) => state,
    }
}

fn overlay(target: &mut Value, state: Value) {
    match (target, state) {
        (Value::Object(fields), Value::Object(captured)) => {
            for (key, value) in captured {
                fields.insert(key, value);
            }
        }
        (target, state) => *target = state,
    }
}
