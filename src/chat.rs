//! Chat-assisted query translation
//!
//! Free-form shell input is routed to an OpenAI chat-completions call that
//! translates the prompt into a single query clause in the surface syntax.
//! The path is inert unless `OPENAI_API_KEY` is set, and the first call is
//! gated behind an explicit confirmation; a transport error or a declined
//! confirmation disables it for the rest of the session.

#![forbid(unsafe_code)]

use std::io::Write;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

const ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str = "\
You translate natural-language questions about a fact base of (id attr val) \
triples into exactly one query clause of the form \
((<x> attr val) (<y> attr <x>) ... -> <x> <y>): a parenthesized list of \
conditions, `->`, then the variables to report. Conditions may be negated \
with a leading `-`. Fields are constants, `<variables>`, or `_`. Reply with \
the clause only, no prose.";

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Request<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

pub struct ChatSession {
    api_key: Option<String>,
    confirmed: bool,
    disabled: bool,
}

impl ChatSession {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            confirmed: false,
            disabled: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some() && !self.disabled
    }

    /// Translate a prompt into a query clause. `None` means the path is
    /// unavailable, was declined, or the call failed (already reported).
    pub fn translate(&mut self, prompt: &str) -> Option<String> {
        let key = match (&self.api_key, self.disabled) {
            (Some(k), false) => k.clone(),
            _ => return None,
        };
        if !self.confirmed && !self.confirm() {
            self.disabled = true;
            println!("Chat disabled for this session.");
            return None;
        }
        self.confirmed = true;
        match self.complete(&key, prompt) {
            Ok(clause) => Some(clause),
            Err(e) => {
                warn!("chat request failed: {e}; disabling chat for this session");
                self.disabled = true;
                None
            }
        }
    }

    fn confirm(&self) -> bool {
        print!("Send free-form prompts to OpenAI? [y/N] ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }

    fn complete(&self, key: &str, prompt: &str) -> anyhow::Result<String> {
        let body = Request {
            model: MODEL,
            messages: vec![
                Message { role: "system", content: SYSTEM_PROMPT },
                Message { role: "user", content: prompt },
            ],
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let response: serde_json::Value = client
            .post(ENDPOINT)
            .bearer_auth(key)
            .json(&body)
            .send()?
            .error_for_status()?
            .json()?;
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("malformed chat response"))?;
        Ok(content.trim().to_string())
    }
}
