use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RefineError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed stream chunk: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stream read: {0}")]
    Io(#[from] std::io::Error),
    #[error("api error in stream: {0}")]
    Api(String),
    #[error("response contained no text")]
    EmptyResponse,
}

/// A hosted text model that streams its answer in fragments.
pub trait GenerativeBackend {
    fn stream_generate(
        &self,
        prompt: &str,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<(), RefineError>;
}

#[derive(Debug)]
pub enum Refinement {
    Refined(String),
    /// The API failed or said nothing; `raw` is passed through unchanged.
    Unrefined { raw: String, reason: RefineError },
    /// Nothing to refine.
    Skipped,
}

impl Refinement {
    pub fn text(&self) -> &str {
        match self {
            Self::Refined(text) => text,
            Self::Unrefined { raw, .. } => raw,
            Self::Skipped => "",
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Refined(text) => text,
            Self::Unrefined { raw, .. } => raw,
            Self::Skipped => String::new(),
        }
    }
}

pub fn correction_prompt(raw_text: &str) -> String {
    format!(
        "다음 텍스트를 자연스럽게 교정해주세요. \n\
         규칙:\n\
         1. 원본의 형태와 길이를 최대한 유지하세요\n\
         2. 불필요한 설명이나 부가 설명은 하지 마세요\n\
         3. 줄바꿈이나 특수문자(/)를 추가하지 마세요\n\
         4. 교정된 텍스트만 출력하세요\n\
         \n\
         원본: {raw_text}\n\
         \n\
         교정:"
    )
}

pub struct Refiner {
    backend: Box<dyn GenerativeBackend>,
    echo: Option<Box<dyn FnMut(&str)>>,
}

impl Refiner {
    pub fn new(backend: Box<dyn GenerativeBackend>) -> Self {
        Self {
            backend,
            echo: None,
        }
    }

    /// Forwards each streamed fragment to `echo` as it arrives.
    pub fn with_echo(mut self, echo: Box<dyn FnMut(&str)>) -> Self {
        self.echo = Some(echo);
        self
    }

    pub fn refine(&mut self, raw_text: &str, seed_token: &str) -> Refinement {
        if raw_text.is_empty() {
            return Refinement::Skipped;
        }
        debug!(seed_token, raw_text, "refining");

        let prompt = correction_prompt(raw_text);
        let mut collected = String::new();
        let echo = &mut self.echo;
        let result = self.backend.stream_generate(&prompt, &mut |fragment: &str| {
            collected.push_str(fragment);
            if let Some(echo) = echo.as_mut() {
                echo(fragment);
            }
        });

        let reason = match result {
            Ok(()) => {
                let trimmed = collected.trim();
                if !trimmed.is_empty() {
                    return Refinement::Refined(trimmed.to_string());
                }
                RefineError::EmptyResponse
            }
            Err(err) => err,
        };
        debug!(seed_token, %reason, "falling back to raw text");
        Refinement::Unrefined {
            raw: raw_text.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Replays fixed fragments, or fails, and records every prompt it sees.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedBackend {
        pub fragments: Vec<String>,
        pub fail: bool,
        pub prompts: Rc<RefCell<Vec<String>>>,
    }

    impl ScriptedBackend {
        pub(crate) fn replying(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }
    }

    impl GenerativeBackend for ScriptedBackend {
        fn stream_generate(
            &self,
            prompt: &str,
            on_fragment: &mut dyn FnMut(&str),
        ) -> Result<(), RefineError> {
            self.prompts.borrow_mut().push(prompt.to_string());
            if self.fail {
                let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
                return Err(RefineError::Io(io));
            }
            for f in &self.fragments {
                on_fragment(f);
            }
            Ok(())
        }
    }

    #[test]
    fn empty_raw_text_skips_the_api() {
        let backend = ScriptedBackend::replying(&["unused"]);
        let prompts = backend.prompts.clone();
        let mut refiner = Refiner::new(Box::new(backend));
        let out = refiner.refine("", "▁hel");
        assert!(matches!(out, Refinement::Skipped));
        assert_eq!(out.text(), "");
        assert!(prompts.borrow().is_empty());
    }

    #[test]
    fn fragments_are_joined_and_trimmed() {
        let mut refiner = Refiner::new(Box::new(ScriptedBackend::replying(&[
            "  고쳐진 ", "문장입니다", "\n",
        ])));
        let out = refiner.refine("고처진 문장", "lo");
        assert!(matches!(&out, Refinement::Refined(t) if t == "고쳐진 문장입니다"));
    }

    #[test]
    fn prompt_embeds_raw_text() {
        let backend = ScriptedBackend::replying(&["ok"]);
        let prompts = backend.prompts.clone();
        let mut refiner = Refiner::new(Box::new(backend));
        refiner.refine("raw words", "lo");
        let seen = prompts.borrow();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("원본: raw words\n"));
        assert!(seen[0].ends_with("교정:"));
    }

    #[test]
    fn api_error_returns_raw_text() {
        let mut refiner = Refiner::new(Box::new(ScriptedBackend::failing()));
        let out = refiner.refine("raw words", "lo");
        assert!(matches!(
            &out,
            Refinement::Unrefined {
                reason: RefineError::Io(_),
                ..
            }
        ));
        assert_eq!(out.into_text(), "raw words");
    }

    #[test]
    fn blank_response_returns_raw_text() {
        let mut refiner = Refiner::new(Box::new(ScriptedBackend::replying(&[" ", "\n"])));
        let out = refiner.refine("raw words", "lo");
        assert!(matches!(
            &out,
            Refinement::Unrefined {
                reason: RefineError::EmptyResponse,
                ..
            }
        ));
        assert_eq!(out.text(), "raw words");
    }

    #[test]
    fn echo_sees_every_fragment() {
        let seen = Rc::new(RefCell::new(String::new()));
        let sink = seen.clone();
        let mut refiner = Refiner::new(Box::new(ScriptedBackend::replying(&["a", "b"])))
            .with_echo(Box::new(move |f: &str| sink.borrow_mut().push_str(f)));
        refiner.refine("x", "lo");
        assert_eq!(seen.borrow().as_str(), "ab");
    }
}
