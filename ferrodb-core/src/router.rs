// ferrodb-core/src/router.rs
// Command router: frames in, engine calls, shaped responses out
//
// The router owns the SecurityContext capability: every command is
// authorized before it touches the engine. Responses always carry
// {code, message, data?, details?, request_id, retryable?} and never an
// internal path or a backtrace.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::batch::{self, BulkOp, BulkOptions};
use crate::database::Database;
use crate::error::{FerroError, Result};
use crate::index::IndexDefinition;
use crate::protocol::{Frame, MessageType};
use crate::transaction::{IsolationLevel, TransactionId};

/// Capability consumed by the router. Authentication and authorization
/// live behind this seam; RBAC/audit implementations plug in from the
/// outside.
pub trait SecurityContext: Send + Sync {
    /// Authenticate AUTH credentials, returning the principal name.
    fn authenticate(&self, credentials: &Value) -> Result<String>;

    /// Authorize one command against an optional collection.
    fn authorize(&self, principal: Option<&str>, command: &str, collection: Option<&str>)
        -> Result<()>;
}

/// Permissive context for embedded use and tests.
pub struct AllowAll;

impl SecurityContext for AllowAll {
    fn authenticate(&self, _credentials: &Value) -> Result<String> {
        Ok("anonymous".to_string())
    }

    fn authorize(&self, _principal: Option<&str>, _command: &str, _collection: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Context that rejects everything unauthenticated (locked-down default
/// for network deployments until real RBAC is wired in).
pub struct RequireAuth;

impl SecurityContext for RequireAuth {
    fn authenticate(&self, credentials: &Value) -> Result<String> {
        match credentials.get("username").and_then(|v| v.as_str()) {
            Some(user) if !user.is_empty() => Ok(user.to_string()),
            _ => Err(FerroError::AuthFailed("missing credentials".into())),
        }
    }

    fn authorize(&self, principal: Option<&str>, command: &str, _collection: Option<&str>) -> Result<()> {
        match principal {
            Some(_) => Ok(()),
            None if command == "PING" => Ok(()),
            None => Err(FerroError::AccessDenied(format!(
                "command {} requires authentication",
                command
            ))),
        }
    }
}

/// Per-connection state the router threads through commands.
#[derive(Default)]
pub struct Session {
    pub principal: Option<String>,
    pub current_tx: Option<TransactionId>,
}

pub struct CommandRouter {
    db: Arc<Database>,
    security: Arc<dyn SecurityContext>,
}

impl CommandRouter {
    pub fn new(db: Arc<Database>, security: Arc<dyn SecurityContext>) -> Self {
        CommandRouter { db, security }
    }

    /// Frame-level entry point for the transport layer.
    pub fn handle_frame(&self, session: &mut Session, frame: &Frame) -> Frame {
        match frame.message_type {
            MessageType::Ping => Frame::new(MessageType::Pong, Vec::new()),
            MessageType::Handshake => {
                let info = json!({"server": "ferrodb", "version": env!("CARGO_PKG_VERSION")});
                Frame::from_json(MessageType::Response, &info)
                    .unwrap_or_else(|_| Frame::new(MessageType::Error, Vec::new()))
            }
            MessageType::Auth => {
                let response = match frame.payload_json() {
                    Ok(credentials) => match self.security.authenticate(&credentials) {
                        Ok(principal) => {
                            session.principal = Some(principal.clone());
                            ok_response(json!({"principal": principal}), request_id_of(&credentials))
                        }
                        Err(err) => error_response(&err, request_id_of(&credentials)),
                    },
                    Err(err) => error_response(&err, generated_request_id()),
                };
                respond(response)
            }
            MessageType::Command
            | MessageType::Transaction
            | MessageType::Bulk
            | MessageType::DbOp => {
                let response = match frame.payload_json() {
                    Ok(request) => self.handle_command(session, &request),
                    Err(err) => error_response(&err, generated_request_id()),
                };
                respond(response)
            }
            MessageType::Response | MessageType::Error | MessageType::Pong => {
                let err = FerroError::Validation("unexpected client message type".into());
                respond(error_response(&err, generated_request_id()))
            }
        }
    }

    /// Command-level entry point: one request document to one response
    /// document.
    pub fn handle_command(&self, session: &mut Session, request: &Value) -> Value {
        let request_id = request_id_of(request);

        let command = match request.get("command").and_then(|v| v.as_str()) {
            Some(command) => command.to_ascii_uppercase(),
            None => {
                return error_response(
                    &FerroError::Validation("request needs a 'command' field".into()),
                    request_id,
                )
            }
        };
        let collection = request.get("collection").and_then(|v| v.as_str());

        if let Err(err) =
            self.security
                .authorize(session.principal.as_deref(), &command, collection)
        {
            return error_response(&err, request_id);
        }

        match self.dispatch(session, &command, collection, request) {
            Ok(data) => ok_response(data, request_id),
            Err(err) => error_response(&err, request_id),
        }
    }

    fn dispatch(
        &self,
        session: &mut Session,
        command: &str,
        collection: Option<&str>,
        request: &Value,
    ) -> Result<Value> {
        let coll = || -> Result<&str> {
            collection
                .ok_or_else(|| FerroError::Validation("command needs a 'collection'".into()))
        };
        let tx = session.current_tx;

        match command {
            // -- key/value style -------------------------------------------------
            "GET" => {
                let id = str_arg(request, "id")?;
                let doc = self.db.get(tx, coll()?, id)?;
                Ok(match doc {
                    Some(doc) => doc.to_value_with_meta(),
                    None => Value::Null,
                })
            }
            "SET" => {
                let id = str_arg(request, "id")?;
                let mut document = obj_arg(request, "document")?;
                document.insert("_id".to_string(), json!(id));
                let doc = self.db.upsert(tx, coll()?, Value::Object(document))?;
                Ok(json!({"_id": doc.id, "version": doc.meta.version}))
            }
            "DELETE" => {
                let id = str_arg(request, "id")?;
                let deleted = self.db.delete(tx, coll()?, id, version_arg(request))?;
                Ok(json!({"deleted": deleted}))
            }
            "EXISTS" => {
                let id = str_arg(request, "id")?;
                Ok(json!({"exists": self.db.exists(tx, coll()?, id)?}))
            }
            "COUNT" => {
                let count = self.db.count(tx, coll()?, request.get("filter"))?;
                Ok(json!({"count": count}))
            }
            "LIST_COLLECTIONS" => Ok(json!(self.db.list_collections())),

            // -- documents -------------------------------------------------------
            "INSERT" => {
                let document = request
                    .get("document")
                    .cloned()
                    .ok_or_else(|| FerroError::Validation("INSERT needs a 'document'".into()))?;
                let doc = self.db.insert(tx, coll()?, document)?;
                Ok(json!({"_id": doc.id, "version": doc.meta.version}))
            }
            "REPLACE" => {
                let id = str_arg(request, "id")?;
                let mut document = obj_arg(request, "document")?;
                document.remove("_id");
                let doc = self
                    .db
                    .replace(tx, coll()?, id, document, version_arg(request))?;
                Ok(json!({"_id": doc.id, "version": doc.meta.version}))
            }
            "UPSERT" => {
                let document = request
                    .get("document")
                    .cloned()
                    .ok_or_else(|| FerroError::Validation("UPSERT needs a 'document'".into()))?;
                let doc = self.db.upsert(tx, coll()?, document)?;
                Ok(json!({"_id": doc.id, "version": doc.meta.version}))
            }
            "PATCH" => {
                let id = str_arg(request, "id")?;
                let update = obj_arg(request, "update")?;
                let doc = self.db.patch(tx, coll()?, id, update, version_arg(request))?;
                Ok(json!({"_id": doc.id, "version": doc.meta.version}))
            }
            "FIND_AND_MODIFY" => {
                let filter = request
                    .get("filter")
                    .ok_or_else(|| FerroError::Validation("FIND_AND_MODIFY needs a 'filter'".into()))?;
                let update = request.get("update").and_then(|v| v.as_object());
                let remove = bool_arg(request, "remove");
                let return_new = bool_arg(request, "return_new");
                let result = self
                    .db
                    .find_and_modify(tx, coll()?, filter, update, remove, return_new)?;
                Ok(result.unwrap_or(Value::Null))
            }
            "INCREMENT" => self.operator_shortcut(tx, coll()?, request, "$inc", "delta"),
            "PUSH" => self.operator_shortcut(tx, coll()?, request, "$push", "value"),
            "PULL" => self.operator_shortcut(tx, coll()?, request, "$pull", "value"),
            "ADD_TO_SET" => self.operator_shortcut(tx, coll()?, request, "$addToSet", "value"),

            // -- queries ---------------------------------------------------------
            "FIND" => {
                let query = request.get("query").cloned().unwrap_or(json!({}));
                let batch_size = usize_arg(request, "batch_size");
                let reply = self.db.find(tx, coll()?, &query, batch_size)?;
                Ok(json!({
                    "cursor_id": reply.cursor_id,
                    "batch": reply.batch,
                    "exhausted": reply.exhausted,
                }))
            }
            "FIND_ONE" => {
                let query = request.get("query").cloned().unwrap_or(json!({}));
                Ok(self
                    .db
                    .find_one(tx, coll()?, &query)?
                    .unwrap_or(Value::Null))
            }
            "DISTINCT" => {
                let field = str_arg(request, "field")?;
                let values = self.db.distinct(tx, coll()?, field, request.get("filter"))?;
                Ok(json!(values))
            }
            "EXPLAIN" => {
                let query = request.get("query").cloned().unwrap_or(json!({}));
                self.db.explain(coll()?, &query)
            }
            "AGGREGATE" => {
                let pipeline = request
                    .get("pipeline")
                    .ok_or_else(|| FerroError::Validation("AGGREGATE needs a 'pipeline'".into()))?;
                let results = self.db.aggregate(tx, coll()?, pipeline)?;
                Ok(json!({"results": results}))
            }
            "GET_MORE" => {
                let cursor_id = u64_arg(request, "cursor_id")?;
                let reply = self.db.get_more(cursor_id, usize_arg(request, "batch_size"))?;
                Ok(json!({
                    "cursor_id": reply.cursor_id,
                    "batch": reply.batch,
                    "exhausted": reply.exhausted,
                }))
            }
            "KILL_CURSOR" => {
                let cursor_id = u64_arg(request, "cursor_id")?;
                Ok(json!({"killed": self.db.kill_cursor(cursor_id)}))
            }

            // -- indexes ---------------------------------------------------------
            "CREATE_INDEX" => {
                let spec = request
                    .get("index")
                    .ok_or_else(|| FerroError::Validation("CREATE_INDEX needs an 'index'".into()))?;
                let def = IndexDefinition::parse(spec)?;
                let name = def.name.clone();
                self.db.create_index(coll()?, def)?;
                Ok(json!({"created": name}))
            }
            "DROP_INDEX" => {
                let name = str_arg(request, "name")?;
                self.db.drop_index(coll()?, name)?;
                Ok(json!({"dropped": name}))
            }
            "LIST_INDEXES" => Ok(serde_json::to_value(self.db.list_indexes(coll()?)?)?),
            "REINDEX" => {
                let name = request.get("name").and_then(|v| v.as_str());
                let rebuilt = self.db.reindex(coll()?, name)?;
                Ok(json!({"rebuilt": rebuilt}))
            }
            "INDEX_STATS" => Ok(serde_json::to_value(self.db.index_stats(coll()?)?)?),

            // -- transactions ----------------------------------------------------
            "BEGIN" => {
                if session.current_tx.is_some() {
                    return Err(FerroError::Validation(
                        "session already has an open transaction".into(),
                    ));
                }
                let isolation = match request.get("isolation").and_then(|v| v.as_str()) {
                    Some(level) => Some(IsolationLevel::parse(level).ok_or_else(|| {
                        FerroError::Validation(format!("unknown isolation level '{}'", level))
                    })?),
                    None => None,
                };
                let tx_id = self.db.begin(isolation)?;
                session.current_tx = Some(tx_id);
                Ok(json!({"tx_id": tx_id}))
            }
            "COMMIT" => {
                let tx_id = session
                    .current_tx
                    .take()
                    .ok_or_else(|| FerroError::Validation("no open transaction".into()))?;
                self.db.commit(tx_id)?;
                Ok(json!({"committed": tx_id}))
            }
            "ROLLBACK" => {
                let tx_id = session
                    .current_tx
                    .take()
                    .ok_or_else(|| FerroError::Validation("no open transaction".into()))?;
                self.db.rollback(tx_id)?;
                Ok(json!({"rolled_back": tx_id}))
            }

            // -- collections -----------------------------------------------------
            "CREATE_COLLECTION" => {
                let name = str_arg(request, "name")?;
                self.db.create_collection(name)?;
                Ok(json!({"created": name}))
            }
            "DROP_COLLECTION" => {
                let name = str_arg(request, "name")?;
                Ok(json!({"dropped": self.db.drop_collection(name)?}))
            }
            "COLLECTION_STATS" => {
                let name = str_arg(request, "name").or_else(|_| coll())?;
                self.db.collection_stats(name)
            }

            // -- bulk ------------------------------------------------------------
            "BULK" => {
                let ops_json = request
                    .get("operations")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        FerroError::Validation("BULK needs an 'operations' array".into())
                    })?;
                let ops = ops_json
                    .iter()
                    .map(BulkOp::parse)
                    .collect::<Result<Vec<_>>>()?;
                let options = BulkOptions {
                    ordered: bool_arg(request, "ordered"),
                    transactional: bool_arg(request, "transactional"),
                };
                let report = batch::execute(&self.db, tx, coll()?, ops, options)?;
                Ok(report.to_value())
            }

            // -- operational -----------------------------------------------------
            "PING" => Ok(json!({"pong": true})),
            "INFO" => Ok(self.db.info()),
            "CONFIG" => Ok(serde_json::to_value(self.db.config())?),

            other => Err(FerroError::Validation(format!(
                "unknown command '{}'",
                other
            ))),
        }
    }

    /// INCREMENT/PUSH/PULL/ADD_TO_SET desugar to a one-operator PATCH.
    fn operator_shortcut(
        &self,
        tx: Option<TransactionId>,
        collection: &str,
        request: &Value,
        operator: &str,
        value_key: &str,
    ) -> Result<Value> {
        let id = str_arg(request, "id")?;
        let field = str_arg(request, "field")?;
        let value = request
            .get(value_key)
            .cloned()
            .ok_or_else(|| FerroError::Validation(format!("command needs '{}'", value_key)))?;
        let update: Map<String, Value> = json!({ operator: { field: value } })
            .as_object()
            .expect("constructed object")
            .clone();
        let doc = self.db.patch(tx, collection, id, update, version_arg(request))?;
        Ok(json!({"_id": doc.id, "version": doc.meta.version}))
    }
}

// ----------------------------------------------------------------------
// Request/response helpers
// ----------------------------------------------------------------------

fn str_arg<'a>(request: &'a Value, key: &str) -> Result<&'a str> {
    request
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| FerroError::Validation(format!("command needs a string '{}'", key)))
}

fn obj_arg(request: &Value, key: &str) -> Result<Map<String, Value>> {
    request
        .get(key)
        .and_then(|v| v.as_object())
        .cloned()
        .ok_or_else(|| FerroError::Validation(format!("command needs an object '{}'", key)))
}

fn bool_arg(request: &Value, key: &str) -> bool {
    request.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn usize_arg(request: &Value, key: &str) -> Option<usize> {
    request.get(key).and_then(|v| v.as_u64()).map(|n| n as usize)
}

fn u64_arg(request: &Value, key: &str) -> Result<u64> {
    request
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| FerroError::Validation(format!("command needs a numeric '{}'", key)))
}

fn version_arg(request: &Value) -> Option<u64> {
    request.get("expected_version").and_then(|v| v.as_u64())
}

fn request_id_of(request: &Value) -> String {
    request
        .get("request_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(generated_request_id)
}

fn generated_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn ok_response(data: Value, request_id: String) -> Value {
    json!({
        "code": "OK",
        "message": "ok",
        "data": data,
        "request_id": request_id,
    })
}

fn error_response(err: &FerroError, request_id: String) -> Value {
    let code = err.code();
    // Internal failures are logged in full but never shipped verbatim
    let message = if code == "INTERNAL_ERROR" {
        tracing::error!(request_id = %request_id, error = %err, "internal error serving request");
        "internal error".to_string()
    } else {
        err.to_string()
    };
    let mut response = json!({
        "code": code,
        "message": message,
        "request_id": request_id,
    });
    if err.retryable() {
        response["retryable"] = json!(true);
    }
    response
}

fn respond(body: Value) -> Frame {
    let message_type = if body.get("code") == Some(&json!("OK")) {
        MessageType::Response
    } else {
        MessageType::Error
    };
    Frame::from_json(message_type, &body)
        .unwrap_or_else(|_| Frame::new(MessageType::Error, Vec::new()))
}
