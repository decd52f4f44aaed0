//! [`RecordStore`] over Odoo's JSON-RPC endpoint.
//!
//! Every call is a `POST /jsonrpc` with a `call` envelope. `common.login`
//! runs once at connect; record access goes through `object.execute_kw`.

use std::cell::Cell;
use std::time::Duration;

use ferry_core::TransportError;
use ferry_core::config::EndpointConfig;
use ferry_core::model::{Domain, Fields, Payload, RecordId, SourceRecord};
use ferry_core::store::RecordStore;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

const RPC_PATH: &str = "/jsonrpc";

/// One authenticated Odoo session.
pub struct OdooRecordStore {
    label: String,
    endpoint: String,
    database: String,
    uid: i64,
    password: String,
    language: String,
    agent: ureq::Agent,
    next_request: Cell<u64>,
}

impl std::fmt::Debug for OdooRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OdooRecordStore")
            .field("label", &self.label)
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("uid", &self.uid)
            .finish_non_exhaustive()
    }
}

impl OdooRecordStore {
    /// Log in to `endpoint` and keep the session's uid.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the server cannot be reached or
    /// rejects the credentials.
    pub fn connect(
        label: &str,
        endpoint: &EndpointConfig,
        language: &str,
    ) -> Result<Self, TransportError> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .user_agent(concat!("ferry/", env!("CARGO_PKG_VERSION")))
            .build();

        let mut store = Self {
            label: label.to_string(),
            endpoint: format!("{}{RPC_PATH}", endpoint.url()),
            database: endpoint.database.clone(),
            uid: 0,
            password: endpoint.password.clone(),
            language: language.to_string(),
            agent,
            next_request: Cell::new(1),
        };

        let reply = store
            .call(
                "common",
                "login",
                json!([endpoint.database, endpoint.username, endpoint.password]),
            )
            .map_err(|failure| store.connect_error(failure.message()))?;

        let uid = reply.as_i64().filter(|uid| *uid > 0).ok_or_else(|| {
            store.connect_error(format!(
                "login rejected for user '{}' on database '{}'",
                endpoint.username, endpoint.database
            ))
        })?;
        store.uid = uid;

        info!(store = label, endpoint = %store.endpoint, uid = store.uid, "connected");
        Ok(store)
    }

    fn connect_error(&self, message: impl Into<String>) -> TransportError {
        TransportError::Connect {
            endpoint: self.endpoint.clone(),
            message: message.into(),
        }
    }

    /// `object.execute_kw(db, uid, password, model, method, args, kwargs)`.
    fn execute_kw(
        &self,
        entity_type: &str,
        method: &str,
        args: Value,
        mut kwargs: Map<String, Value>,
    ) -> Result<Value, TransportError> {
        kwargs.insert("context".into(), json!({ "lang": self.language }));
        let params = json!([
            self.database,
            self.uid,
            self.password,
            entity_type,
            method,
            args,
            kwargs
        ]);
        debug!(store = %self.label, entity_type, method, "execute_kw");
        self.call("object", "execute_kw", params)
            .map_err(|failure| match failure {
                RpcFailure::Unreachable(message) => self.connect_error(message),
                RpcFailure::Fault(message) => TransportError::Remote {
                    entity_type: entity_type.to_string(),
                    method: method.to_string(),
                    message,
                },
                RpcFailure::Malformed(message) => TransportError::Decode {
                    method: method.to_string(),
                    message,
                },
            })
    }

    fn call(&self, service: &str, method: &str, args: Value) -> Result<Value, RpcFailure> {
        let request_id = self.next_request.get();
        self.next_request.set(request_id + 1);

        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": { "service": service, "method": method, "args": args },
            "id": request_id,
        });

        let response = match self.agent.post(&self.endpoint).send_json(body) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let text = response.into_string().unwrap_or_default();
                return Err(RpcFailure::Fault(format!("HTTP {code}: {}", text.trim())));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(RpcFailure::Unreachable(transport.to_string()));
            }
        };

        let reply: Value = response
            .into_json()
            .map_err(|e| RpcFailure::Malformed(format!("response is not JSON: {e}")))?;
        decode_reply(reply)
    }
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

impl RecordStore for OdooRecordStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn fetch_page(
        &self,
        entity_type: &str,
        filter: &Domain,
        offset: usize,
        limit: usize,
        order: &str,
    ) -> Result<Vec<SourceRecord>, TransportError> {
        let mut kwargs = Map::new();
        kwargs.insert("offset".into(), json!(offset));
        kwargs.insert("limit".into(), json!(limit));
        kwargs.insert("order".into(), json!(order));
        let reply = self.execute_kw(
            entity_type,
            "search_read",
            json!([domain_to_json(filter)]),
            kwargs,
        )?;

        let Value::Array(rows) = reply else {
            return Err(decode_error("search_read", "expected a list of records"));
        };
        rows.into_iter().map(record_from_json).collect()
    }

    fn search(
        &self,
        entity_type: &str,
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<RecordId>, TransportError> {
        let mut kwargs = Map::new();
        kwargs.insert("limit".into(), json!(limit));
        let reply = self.execute_kw(
            entity_type,
            "search",
            json!([domain_to_json(domain)]),
            kwargs,
        )?;
        ids_from_json("search", &reply)
    }

    fn create(&self, entity_type: &str, payload: &Payload) -> Result<RecordId, TransportError> {
        let reply = self.execute_kw(entity_type, "create", json!([payload]), Map::new())?;
        // Newer servers answer a single-dict create with a one-element list.
        let id = match &reply {
            Value::Array(_) => ids_from_json("create", &reply)?.first().copied(),
            other => RecordId::from_value(other),
        };
        id.ok_or_else(|| decode_error("create", format!("expected a record id, got {reply}")))
    }

    fn update(
        &self,
        entity_type: &str,
        id: RecordId,
        payload: &Payload,
    ) -> Result<(), TransportError> {
        let reply = self.execute_kw(
            entity_type,
            "write",
            json!([[id.get()], payload]),
            Map::new(),
        )?;
        if reply == Value::Bool(true) {
            Ok(())
        } else {
            Err(TransportError::Remote {
                entity_type: entity_type.to_string(),
                method: "write".to_string(),
                message: format!("write of record {id} returned {reply}"),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum RpcFailure {
    Unreachable(String),
    Fault(String),
    Malformed(String),
}

impl RpcFailure {
    fn message(self) -> String {
        match self {
            Self::Unreachable(message) | Self::Fault(message) | Self::Malformed(message) => {
                message
            }
        }
    }
}

/// Unwrap a JSON-RPC reply into its `result`.
fn decode_reply(reply: Value) -> Result<Value, RpcFailure> {
    let Value::Object(mut envelope) = reply else {
        return Err(RpcFailure::Malformed("reply is not an object".into()));
    };
    if let Some(error) = envelope.remove("error") {
        // Odoo puts the Python exception text in error.data.message.
        let message = error
            .pointer("/data/message")
            .or_else(|| error.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unknown server error")
            .to_string();
        return Err(RpcFailure::Fault(message));
    }
    envelope
        .remove("result")
        .ok_or_else(|| RpcFailure::Malformed("reply has neither result nor error".into()))
}

/// `[["field", "=", value], ...]`
fn domain_to_json(domain: &Domain) -> Value {
    Value::Array(
        domain
            .terms()
            .iter()
            .map(|term| json!([term.field, "=", term.value]))
            .collect(),
    )
}

fn record_from_json(row: Value) -> Result<SourceRecord, TransportError> {
    let Value::Object(object) = row else {
        return Err(decode_error("search_read", "record is not an object"));
    };
    let mut fields: Fields = object.into_iter().collect();
    let id = fields
        .remove("id")
        .as_ref()
        .and_then(RecordId::from_value)
        .ok_or_else(|| decode_error("search_read", "record without a positive id"))?;
    Ok(SourceRecord::new(id, fields))
}

fn ids_from_json(method: &str, reply: &Value) -> Result<Vec<RecordId>, TransportError> {
    let Value::Array(items) = reply else {
        return Err(decode_error(method, format!("expected a list of ids, got {reply}")));
    };
    items
        .iter()
        .map(|item| {
            RecordId::from_value(item)
                .ok_or_else(|| decode_error(method, format!("not a record id: {item}")))
        })
        .collect()
}

fn decode_error(method: &str, message: impl Into<String>) -> TransportError {
    TransportError::Decode {
        method: method.to_string(),
        message: message.into(),
    }
}
