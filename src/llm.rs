//! Client for the remote chat completions API.
//!
//! All outbound requests share one semaphore so at most
//! `max_concurrent_requests` are in flight; callers suspend until a permit
//! frees. No retries, no explicit timeout beyond the transport default.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::error;

use crate::sanitize::{self, FormatMode};

/// Shown to the user when the API answers with a non-success status.
pub const API_ERROR_REPLY: &str =
    "Произошла ошибка при обращении к API. Пожалуйста, попробуйте позже.";

/// Shown to the user on any other failure (transport, malformed body).
pub const GENERIC_ERROR_REPLY: &str =
    "Произошла ошибка при обработке запроса. Пожалуйста, попробуйте еще раз позже.";

/// Instruction sent with every request: answer directly, no visible
/// reasoning, act as a supportive digital-detox mentor.
const SYSTEM_PROMPT: &str = "Пожалуйста, отвечайте на запросы пользователя напрямую, \
без размышлений, анализа или пошаговых рассуждений. Старайтесь давать развернутые, \
подробные ответы, объясняя контекст и предоставляя полезную информацию. Избегайте \
слишком коротких ответов. Твоя основная цель — помогать пользователям преодолевать \
зависимость от социальных сетей, предоставляя поддержку, стратегии и конструктивные \
советы. Действуй как заботливый и мудрый наставник, который:\n\n\
1. Внимательно слушает пользователя\n\
2. Не осуждает, а поддерживает и мотивирует\n\
3. Предлагает практические и индивидуальные стратегии\n\n\
Принципы общения:\n\
- Всегда начинай с эмпатии и понимания сложности преодоления зависимости\n\
- Предлагай конкретные, реалистичные шаги для сокращения времени в социальных сетях\n\
- Помогай пользователю осознать триггеры и механизмы зависимого поведения\n\
- Учи методам саморегуляции и замещения деструктивных привычек\n\n\
Когда пользователь пишет \"Сегодня я...\", детально анализируй его действия и прогресс. \
Обращай внимание на успехи в уменьшении времени в социальных сетях, эмоциональное \
состояние, новые активности и трудности, которые встретились.\n\n\
Важно: Создавай безопасное, доверительное пространство для честного диалога о зависимости.";

pub struct ModelClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    mode: FormatMode,
    limiter: Arc<Semaphore>,
    max_concurrent: usize,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug)]
pub enum Error {
    Http(String),
    Api { status: u16, body: String },
    Parse(String),
    Empty,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Api { status, body } => write!(f, "API error {status}: {body}"),
            Error::Parse(e) => write!(f, "Parse error: {e}"),
            Error::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for Error {}

impl ModelClient {
    pub fn new(
        api_url: String,
        api_key: String,
        model: String,
        mode: FormatMode,
        max_concurrent: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url,
            api_key,
            model,
            mode,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn mode(&self) -> FormatMode {
        self.mode
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// One chat turn against the remote model. The caller gets a
    /// display-ready string in every case: the sanitized reply on success,
    /// one of two generic error strings otherwise.
    pub async fn complete(&self, prompt: &str) -> String {
        // Never closed, so acquire cannot fail.
        let _permit = self
            .limiter
            .acquire()
            .await
            .expect("request limiter closed");

        match self.chat(prompt).await {
            Ok(content) => sanitize::sanitize(&content, self.mode),
            Err(Error::Api { status, body }) => {
                error!("API returned {status}: {body}");
                API_ERROR_REPLY.to_string()
            }
            Err(e) => {
                error!("Model request failed: {e}");
                GENERIC_ERROR_REPLY.to_string()
            }
        }
    }

    /// Raw request/response cycle, no sanitization.
    async fn chat(&self, prompt: &str) -> Result<String, Error> {
        let request = ApiRequest {
            model: &self.model,
            messages: vec![
                ApiMessage { role: "system", content: SYSTEM_PROMPT },
                ApiMessage { role: "user", content: prompt },
            ],
        };

        let response = self
            .http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, body });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or(Error::Empty)
    }
}
