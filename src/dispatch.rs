//! Generation dispatcher.
//!
//! Forwards generate and chat requests to the configured [`LlmBackend`].
//! When a request names a context, the dispatcher resolves that context's
//! vector binding and hands its identity to the backend as a
//! [`RetrievalContext`]; retrieval itself is the backend's job.
//!
//! The dispatcher never writes to the store and holds no transaction while
//! the backend call is in flight: the context and binding lookups are
//! short autocommit reads that finish before the backend is called.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::context_store::ContextStore;
use crate::error::{DispatchError, DispatchResult};
use crate::llm::{
    ChatCall, ChatMessage, ChatResult, GenerateCall, GenerationResult, LlmBackend, ModelParams,
    RetrievalContext,
};
use crate::models::Tenant;
use crate::store::Stores;
use crate::vector_binding::VectorBindings;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub model_params: ModelParams,
    #[serde(default)]
    pub context_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model_params: ModelParams,
    #[serde(default)]
    pub context_id: Option<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn LlmBackend>,
    contexts: ContextStore,
    bindings: VectorBindings,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        contexts: ContextStore,
        bindings: VectorBindings,
    ) -> Self {
        Self {
            backend,
            contexts,
            bindings,
        }
    }

    pub fn from_stores(backend: Arc<dyn LlmBackend>, stores: &Stores) -> Self {
        Self::new(backend, stores.contexts.clone(), stores.bindings.clone())
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn generate(
        &self,
        tenant: &Tenant,
        request: GenerateRequest,
    ) -> DispatchResult<GenerationResult> {
        if request.prompt.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        validate_params(&request.model_params)?;

        let retrieval = self
            .retrieval_for(tenant, request.context_id.as_deref())
            .await?;
        let call = GenerateCall {
            prompt: request.prompt,
            params: request.model_params,
            retrieval,
        };

        let started = Instant::now();
        match self.backend.generate(&call).await {
            Ok(result) => {
                info!(
                    tenant = %tenant,
                    backend = self.backend.name(),
                    model = %result.model,
                    context_id = ?request.context_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    completion_tokens = result.usage.completion_tokens,
                    "generate completed"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(
                    tenant = %tenant,
                    backend = self.backend.name(),
                    error = %e,
                    "generate failed"
                );
                Err(e)
            }
        }
    }

    pub async fn chat(&self, tenant: &Tenant, request: ChatRequest) -> DispatchResult<ChatResult> {
        if request.messages.is_empty() {
            return Err(DispatchError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }
        if let Some(pos) = request
            .messages
            .iter()
            .position(|m| m.content.trim().is_empty())
        {
            return Err(DispatchError::InvalidRequest(format!(
                "message {} has empty content",
                pos
            )));
        }
        validate_params(&request.model_params)?;

        let retrieval = self
            .retrieval_for(tenant, request.context_id.as_deref())
            .await?;
        let call = ChatCall {
            messages: request.messages,
            params: request.model_params,
            retrieval,
        };

        let started = Instant::now();
        match self.backend.chat(&call).await {
            Ok(result) => {
                info!(
                    tenant = %tenant,
                    backend = self.backend.name(),
                    model = %result.model,
                    context_id = ?request.context_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "chat completed"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(tenant = %tenant, backend = self.backend.name(), error = %e, "chat failed");
                Err(e)
            }
        }
    }

    /// Resolve the binding for `context_id`. The context must exist for the
    /// tenant; a context without a binding yields `None`.
    async fn retrieval_for(
        &self,
        tenant: &Tenant,
        context_id: Option<&str>,
    ) -> DispatchResult<Option<RetrievalContext>> {
        let Some(context_id) = context_id else {
            return Ok(None);
        };

        self.contexts.get_context(tenant, context_id).await?;
        let binding = self.bindings.get_binding(tenant, context_id).await?;

        Ok(binding.map(|b| RetrievalContext {
            context_id: b.context_id,
            binding_id: b.id,
            vdb: b.vdb,
            vdb_collection: b.vdb_collection,
        }))
    }
}

fn validate_params(params: &ModelParams) -> DispatchResult<()> {
    if let Some(model) = &params.model {
        if model.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "model_params.model must not be empty".to_string(),
            ));
        }
    }
    if let Some(t) = params.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(DispatchError::InvalidRequest(format!(
                "model_params.temperature must be in [0.0, 2.0], got {}",
                t
            )));
        }
    }
    if let Some(p) = params.top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(DispatchError::InvalidRequest(format!(
                "model_params.top_p must be in [0.0, 1.0], got {}",
                p
            )));
        }
    }
    if params.max_tokens == Some(0) {
        return Err(DispatchError::InvalidRequest(
            "model_params.max_tokens must be >= 1".to_string(),
        ));
    }
    Ok(())
}
