//! Inbound invocation → snippet lookup → policy → compile → execute →
//! transport response.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use compile::{CompileError, CompileUnit, Compiler};
use host::backend::StoreError;
use host::context::{collect_multi, decode_secret};
use host::{GuestValue, InvocationContext, Snippet};
use pool::{ExecError, ExecutionResult, Invocation, WorkerPool};

use crate::builtin;
use crate::store::SqliteStore;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const BYTES_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("function {reference}/{name} not found")]
    NotFound { reference: String, name: String },
    #[error("snippet {0} not found")]
    UnknownSnippet(String),
    #[error("function is disabled")]
    Disabled,
    #[error("function is private")]
    Forbidden,
    #[error("authentication required")]
    Unauthorized,
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::NotFound { .. } | DispatchError::UnknownSnippet(_) => 404,
            DispatchError::Disabled => 400,
            DispatchError::Forbidden => 403,
            DispatchError::Unauthorized => 401,
            DispatchError::Compile(_) => 500,
            DispatchError::Exec(err) => err.status,
            DispatchError::Store(err) => err.status(),
        }
    }
}

/// Caller credentials as seen by the transport.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// `Authorization: Bearer <token>`.
    pub bearer: Option<String>,
    /// `session` cookie.
    pub session: Option<String>,
    /// `?token=` query parameter.
    pub query_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    api_tokens: HashSet<String>,
    session_tokens: HashSet<String>,
}

impl AuthPolicy {
    pub fn new(api_tokens: HashSet<String>, session_tokens: HashSet<String>) -> Self {
        Self {
            api_tokens,
            session_tokens,
        }
    }

    /// A recognized session cookie or bearer header.
    pub fn is_authenticated(&self, credentials: &Credentials) -> bool {
        let session = credentials
            .session
            .as_ref()
            .is_some_and(|token| self.session_tokens.contains(token));
        session || self.valid_token(credentials.bearer.as_deref())
    }

    /// Private snippets additionally accept the API token as `?token=`.
    pub fn may_access_private(&self, credentials: &Credentials) -> bool {
        self.is_authenticated(credentials) || self.valid_token(credentials.query_token.as_deref())
    }

    fn valid_token(&self, token: Option<&str>) -> bool {
        token.is_some_and(|token| self.api_tokens.contains(token))
    }
}

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub reference: String,
    pub name: String,
    pub method: String,
    /// Path below the route prefix, e.g. `/blog/hello/extra`.
    pub path: String,
    /// Original URL including the query string.
    pub url: String,
    pub query: Vec<(String, String)>,
    /// Header names already lowercased.
    pub headers: Vec<(String, String)>,
    pub params: BTreeMap<String, String>,
    pub body: serde_json::Value,
    pub ip: String,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: ResponseBody,
}

impl TransportResponse {
    fn from_execution(result: ExecutionResult) -> Self {
        let status = result.meta.status();
        let content_type = result.meta.content_type;
        match result.value {
            None => TransportResponse {
                status,
                content_type,
                body: ResponseBody::Empty,
            },
            Some(GuestValue::Bytes(bytes)) => TransportResponse {
                status,
                content_type: content_type.or_else(|| Some(BYTES_CONTENT_TYPE.to_string())),
                body: ResponseBody::Bytes(bytes),
            },
            Some(GuestValue::String(text)) => TransportResponse {
                status,
                content_type: content_type.or_else(|| Some(TEXT_CONTENT_TYPE.to_string())),
                body: ResponseBody::Text(text),
            },
            Some(value) => TransportResponse {
                status,
                content_type: content_type.or_else(|| Some(JSON_CONTENT_TYPE.to_string())),
                body: ResponseBody::Json(value.to_json()),
            },
        }
    }
}

pub struct Dispatcher {
    store: Arc<SqliteStore>,
    compiler: Compiler,
    pool: Arc<WorkerPool>,
    auth: AuthPolicy,
    provisioned: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SqliteStore>,
        compiler: Compiler,
        pool: Arc<WorkerPool>,
        auth: AuthPolicy,
    ) -> Self {
        Self {
            store,
            compiler,
            pool,
            auth,
            provisioned: AtomicBool::new(false),
        }
    }

    pub fn auth(&self) -> &AuthPolicy {
        &self.auth
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Provision built-ins once per process. A failed attempt is retried on
    /// the next call.
    pub fn ensure_builtins(&self) -> Result<(), DispatchError> {
        if self.provisioned.load(Ordering::Acquire) {
            return Ok(());
        }
        builtin::provision(&self.store)?;
        self.provisioned.store(true, Ordering::Release);
        Ok(())
    }

    pub fn resolve(
        &self,
        reference: &str,
        name: &str,
        method: &str,
    ) -> Result<Snippet, DispatchError> {
        self.ensure_builtins()?;
        self.store
            .find_snippets(reference, name)?
            .into_iter()
            .find(|snippet| snippet.accepts_method(method))
            .ok_or_else(|| DispatchError::NotFound {
                reference: reference.to_string(),
                name: name.to_string(),
            })
    }

    pub async fn invoke(
        &self,
        request: InboundRequest,
    ) -> Result<TransportResponse, DispatchError> {
        let snippet = self.resolve(&request.reference, &request.name, &request.method)?;

        if !snippet.enabled {
            return Err(DispatchError::Disabled);
        }
        if snippet.private && !self.auth.may_access_private(&request.credentials) {
            return Err(DispatchError::Forbidden);
        }

        let code = self.compiler.compile(&CompileUnit {
            id: &snippet.id,
            reference: &snippet.reference,
            name: &snippet.name,
            source: &snippet.source,
            updated_at: snippet.updated_at.timestamp_millis(),
        })?;

        let is_authenticated = self.auth.is_authenticated(&request.credentials);
        let invocation = Invocation {
            namespace: snippet.namespace(),
            code,
            context: InvocationContext {
                method: request.method.to_ascii_uppercase(),
                path: request.path,
                url: request.url,
                query: collect_multi(request.query),
                headers: collect_multi(request.headers),
                params: request.params,
                body: request.body,
                ip: request.ip,
                is_authenticated,
                secret: decode_secret(snippet.secret.as_deref()),
                model: snippet.projection(),
            },
        };

        let started = std::time::Instant::now();
        let result = self.pool.execute(invocation).await;
        match &result {
            Ok(_) => tracing::debug!(
                "fn {} finished in {:?}",
                snippet.namespace(),
                started.elapsed()
            ),
            Err(err) => tracing::info!(
                "fn {} failed with {}: {}",
                snippet.namespace(),
                err.status,
                err.message
            ),
        }
        Ok(TransportResponse::from_execution(result?))
    }

    /// Restore a built-in snippet's canonical source, or delete any other
    /// snippet.
    pub fn reset(&self, id: &str) -> Result<ResetOutcome, DispatchError> {
        let snippet = self
            .store
            .snippet_by_id(id)?
            .ok_or_else(|| DispatchError::UnknownSnippet(id.to_string()))?;

        let outcome = match builtin::canonical_source(&snippet.reference, &snippet.name)
            .filter(|_| snippet.built_in)
        {
            Some(source) => {
                self.store.replace_source(id, source, Utc::now())?;
                ResetOutcome::Restored
            }
            None => {
                self.store.delete_snippet(id)?;
                ResetOutcome::Deleted
            }
        };
        self.compiler.cache().invalidate(id);
        tracing::info!("fn {} reset: {:?}", snippet.namespace(), outcome);
        Ok(outcome)
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "pool": self.pool.stats(),
            "compiler": self.compiler.cache().stats(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Restored,
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use host::ResponseMeta;
    use serde_json::json;

    fn policy() -> AuthPolicy {
        AuthPolicy::new(
            HashSet::from(["api".to_string()]),
            HashSet::from(["sess".to_string()]),
        )
    }

    #[test]
    fn private_access_accepts_query_token_but_authentication_does_not() {
        let policy = policy();
        let query_only = Credentials {
            query_token: Some("api".into()),
            ..Default::default()
        };
        assert!(policy.may_access_private(&query_only));
        assert!(!policy.is_authenticated(&query_only));

        let session = Credentials {
            session: Some("sess".into()),
            ..Default::default()
        };
        assert!(policy.is_authenticated(&session));

        let wrong = Credentials {
            bearer: Some("nope".into()),
            session: Some("api".into()),
            query_token: Some("sess".into()),
        };
        assert!(!policy.may_access_private(&wrong));
    }

    #[test]
    fn responses_pick_default_content_types() {
        let meta = ResponseMeta::default();
        let shaped = |value| {
            TransportResponse::from_execution(ExecutionResult {
                value,
                meta: meta.clone(),
            })
        };

        let empty = shaped(None);
        assert_eq!(empty.body, ResponseBody::Empty);
        assert_eq!(empty.content_type, None);

        let bytes = shaped(Some(GuestValue::Bytes(vec![1])));
        assert_eq!(bytes.content_type.as_deref(), Some(BYTES_CONTENT_TYPE));

        let text = shaped(Some(GuestValue::from("hi")));
        assert_eq!(text.body, ResponseBody::Text("hi".into()));

        let object = shaped(Some(GuestValue::from(json!({ "a": 1 }))));
        assert_eq!(object.body, ResponseBody::Json(json!({ "a": 1 })));
        assert_eq!(object.content_type.as_deref(), Some(JSON_CONTENT_TYPE));

        let custom = TransportResponse::from_execution(ExecutionResult {
            value: Some(GuestValue::from("<p>hi</p>")),
            meta: ResponseMeta {
                status: Some(202),
                content_type: Some("text/html".into()),
                sent: true,
            },
        });
        assert_eq!(custom.status, 202);
        assert_eq!(custom.content_type.as_deref(), Some("text/html"));
    }

    #[test]
    fn errors_map_to_statuses() {
        let not_found = DispatchError::NotFound {
            reference: "blog".into(),
            name: "missing".into(),
        };
        assert_eq!(not_found.status(), 404);
        assert_eq!(not_found.to_string(), "function blog/missing not found");
        assert_eq!(DispatchError::Disabled.status(), 400);
        assert_eq!(DispatchError::Forbidden.status(), 403);
        assert_eq!(DispatchError::from(ExecError::timeout()).status(), 504);
        assert_eq!(
            DispatchError::from(StoreError::Conflict("k".into())).status(),
            409
        );
    }
}
