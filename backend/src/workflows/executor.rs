// Workflow Executor - Executes workflow actions

use chrono::Utc;
use flowcore_shared::{
    ActionKind, CreateDataAction, DeleteDataAction, ExecuteScriptAction, GenerateAiContentAction,
    SendEmailAction, UpdateDataAction, User, WaitAction, WebhookAction, WorkflowAction,
};
use reqwest::{header::HeaderMap, header::HeaderName, header::HeaderValue, Method};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::actions::ActionOutcome;
use super::sandbox::ScriptSandbox;
use super::template::{render, scope, substitute};
use crate::error::{WorkflowError, WorkflowResult};
use crate::services::email::parse_recipients;
use crate::services::{AiProvider, AiRequest, DataLayer, EmailTransport, OutgoingEmail};

#[derive(Clone)]
pub struct WorkflowExecutor {
    http: reqwest::Client,
    data: Arc<dyn DataLayer>,
    email: Option<Arc<dyn EmailTransport>>,
    ai: Option<Arc<dyn AiProvider>>,
    sandbox: ScriptSandbox,
    env: Map<String, Value>,
}

impl WorkflowExecutor {
    pub fn new(http: reqwest::Client, data: Arc<dyn DataLayer>, sandbox: ScriptSandbox) -> Self {
        Self {
            http,
            data,
            email: None,
            ai: None,
            sandbox,
            env: Map::new(),
        }
    }

    pub fn with_email(mut self, email: Arc<dyn EmailTransport>) -> Self {
        self.email = Some(email);
        self
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiProvider>) -> Self {
        self.ai = Some(ai);
        self
    }

    /// Variables visible to templates under `env`
    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = env;
        self
    }

    /// Execute a single action. Never fails: errors become a failed outcome.
    pub async fn execute(
        &self,
        action: &WorkflowAction,
        context: &Value,
        user: Option<&User>,
    ) -> ActionOutcome {
        let start = Instant::now();
        info!("Executing action: {} ({})", action.name, action.kind.type_name());

        let scope = scope(context, &self.env, user);

        let result = match &action.kind {
            ActionKind::Webhook(hook) => self.execute_webhook(hook, &scope).await,
            ActionKind::CreateData(create) => self.execute_create(create, &scope, user).await,
            ActionKind::UpdateData(update) => self.execute_update(update, &scope, user).await,
            ActionKind::DeleteData(delete) => self.execute_delete(delete, &scope, user).await,
            ActionKind::GenerateAiContent(ai) => self.execute_ai(ai, &scope).await,
            ActionKind::SendEmail(email) => self.execute_email(email, &scope).await,
            ActionKind::ExecuteScript(script) => self.execute_script(script, context, user).await,
            ActionKind::Wait(wait) => Ok(self.execute_wait(wait)),
        };

        let duration = start.elapsed().as_millis() as i64;

        match result {
            Ok(outcome) => outcome.with_duration(duration),
            Err(e) => {
                error!("Action {} failed: {}", action.name, e);
                ActionOutcome::failure(&e.to_string()).with_duration(duration)
            }
        }
    }

    // ===== Action Implementations =====

    async fn execute_webhook(&self, hook: &WebhookAction, scope: &Value) -> WorkflowResult<ActionOutcome> {
        let url = render(&hook.url, scope);
        let method = Method::from_bytes(hook.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| WorkflowError::InvalidAction(format!("unknown HTTP method `{}`", hook.method)))?;

        let mut headers = HeaderMap::new();
        if let Some(Value::Object(raw)) = hook.headers.as_ref().map(|h| substitute(h, scope)) {
            for (name, value) in raw {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| WorkflowError::InvalidAction(format!("invalid header `{}`", name)))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|_| WorkflowError::InvalidAction(format!("invalid value for header `{}`", name.as_str())))?;
                headers.insert(name, value);
            }
        }

        let mut request = self.http.request(method.clone(), &url).headers(headers);
        if let Some(body) = &hook.body {
            request = request.json(&substitute(body, scope));
        }

        debug!("Webhook {} {}", method, url);
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let captured = json!({ "status": status.as_u16(), "body": body });

        if status.is_success() {
            Ok(ActionOutcome::success().with_patch("webhookResponse", captured))
        } else {
            Ok(ActionOutcome::failure(&format!("webhook returned {}", status))
                .with_patch("webhookResponse", captured))
        }
    }

    async fn execute_create(
        &self,
        create: &CreateDataAction,
        scope: &Value,
        user: Option<&User>,
    ) -> WorkflowResult<ActionOutcome> {
        let data = substitute(&create.data_to_create, scope);
        let id = self.data.create(&create.target_model, data, user).await?;

        Ok(ActionOutcome::success().with_patch(
            "createdData",
            json!({ "id": id, "model": create.target_model }),
        ))
    }

    async fn execute_update(
        &self,
        update: &UpdateDataAction,
        scope: &Value,
        user: Option<&User>,
    ) -> WorkflowResult<ActionOutcome> {
        let selector = substitute(&update.target_selector, scope);
        let patch = substitute(&update.fields_to_update, scope);
        let modified = self
            .data
            .update(&update.target_model, selector, patch, user)
            .await?;

        Ok(ActionOutcome::success().with_patch("updatedData", json!({ "modifiedCount": modified })))
    }

    async fn execute_delete(
        &self,
        delete: &DeleteDataAction,
        scope: &Value,
        user: Option<&User>,
    ) -> WorkflowResult<ActionOutcome> {
        let selector = substitute(&delete.target_selector, scope);
        let deleted = self.data.delete(&delete.target_model, selector, user).await?;

        Ok(ActionOutcome::success().with_patch("deletedData", json!({ "deletedCount": deleted })))
    }

    async fn execute_ai(
        &self,
        ai: &GenerateAiContentAction,
        scope: &Value,
    ) -> WorkflowResult<ActionOutcome> {
        let provider = self
            .ai
            .as_ref()
            .ok_or_else(|| WorkflowError::Ai("no AI provider configured".to_string()))?;

        let content = provider
            .generate(AiRequest {
                prompt: render(&ai.prompt, scope),
                system_prompt: ai.system_prompt.as_deref().map(|s| render(s, scope)),
                model: ai.model.clone(),
                temperature: ai.temperature,
                max_tokens: ai.max_tokens,
            })
            .await?;

        Ok(ActionOutcome::success().with_patch("aiContent", Value::String(content)))
    }

    async fn execute_email(&self, email: &SendEmailAction, scope: &Value) -> WorkflowResult<ActionOutcome> {
        let transport = self
            .email
            .as_ref()
            .ok_or_else(|| WorkflowError::Email("no email transport configured".to_string()))?;

        let to = parse_recipients(&render(&email.to, scope));
        if to.is_empty() {
            return Err(WorkflowError::Email("recipient list rendered empty".to_string()));
        }
        let cc = email
            .cc
            .as_deref()
            .map(|cc| parse_recipients(&render(cc, scope)))
            .unwrap_or_default();

        transport
            .send(OutgoingEmail {
                to,
                cc,
                subject: render(&email.subject, scope),
                body: render(&email.content, scope),
                is_html: email.is_html,
            })
            .await?;

        Ok(ActionOutcome::success())
    }

    async fn execute_script(
        &self,
        script: &ExecuteScriptAction,
        context: &Value,
        user: Option<&User>,
    ) -> WorkflowResult<ActionOutcome> {
        let timeout = script.timeout_ms.map(Duration::from_millis);
        let result = self.sandbox.run(&script.script, context, user, timeout).await?;

        Ok(ActionOutcome::success().with_patch("result", result))
    }

    fn execute_wait(&self, wait: &WaitAction) -> ActionOutcome {
        let resume_at = Utc::now() + wait.as_duration();
        debug!("Waiting until {}", resume_at);
        ActionOutcome::success().with_pause(resume_at)
    }
}
