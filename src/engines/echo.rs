//! Echo engine for testing.
//!
//! This engine "recognizes" an image by decoding its bytes as UTF-8 text. A
//! few magic prefixes let tests and smoke runs inject failures:
//!
//! - `!fail`: transient recognition error.
//! - `!fatal`: the engine reports itself unusable.
//! - `!panic`: the engine panics.
//! - `!hang`: recognition never finishes.

use std::{collections::HashMap, time::Duration};

use tokio::time;

use crate::{image_ref::ImageData, prelude::*, scheduler::WorkerId};

use super::{
    BoundingBox, EngineError, EngineOutput, OcrEngine, OcrEngineFactory, RecognizedWord,
};

/// Width of one character cell in our fake bounding boxes.
const CHAR_WIDTH: u32 = 10;

/// Height of one line in our fake bounding boxes.
const LINE_HEIGHT: u32 = 20;

/// How an [`EchoEngine`] behaves.
#[derive(Clone, Debug, Default)]
pub struct EchoBehavior {
    /// How long each setup step takes.
    pub setup_latency: Duration,

    /// How long each recognition takes.
    pub latency: Duration,

    /// Fail `load`.
    pub fail_load: bool,

    /// Languages which `load_language` cannot find.
    pub missing_languages: Vec<String>,
}

/// Creates [`EchoEngine`]s, optionally with different behavior per worker.
#[derive(Clone, Debug, Default)]
pub struct EchoEngineFactory {
    default: EchoBehavior,
    per_worker: HashMap<WorkerId, EchoBehavior>,
}

impl EchoEngineFactory {
    /// Create a factory where every engine behaves like `default`.
    pub fn new(default: EchoBehavior) -> Self {
        Self {
            default,
            per_worker: HashMap::new(),
        }
    }

    /// Override the behavior of one worker's engine.
    #[cfg(test)]
    pub fn with_worker(mut self, worker: WorkerId, behavior: EchoBehavior) -> Self {
        self.per_worker.insert(worker, behavior);
        self
    }
}

impl OcrEngineFactory for EchoEngineFactory {
    fn create_engine(&self, worker: WorkerId) -> Box<dyn OcrEngine> {
        let behavior = self
            .per_worker
            .get(&worker)
            .unwrap_or(&self.default)
            .clone();
        Box::new(EchoEngine::new(behavior))
    }
}

/// Echo engine for testing.
#[derive(Debug)]
pub struct EchoEngine {
    behavior: EchoBehavior,
    loaded: bool,
    languages: Vec<String>,
}

impl EchoEngine {
    /// Create a new echo engine.
    pub fn new(behavior: EchoBehavior) -> Self {
        Self {
            behavior,
            loaded: false,
            languages: vec![],
        }
    }

    async fn setup_delay(&self) {
        if !self.behavior.setup_latency.is_zero() {
            time::sleep(self.behavior.setup_latency).await;
        }
    }
}

/// Lay out words on a fixed character grid.
fn grid_words(text: &str) -> Vec<RecognizedWord> {
    let mut words = vec![];
    for (line_idx, line) in text.lines().enumerate() {
        let mut column = 0;
        for token in line.split(' ') {
            if !token.trim().is_empty() {
                words.push(RecognizedWord {
                    text: token.trim().to_owned(),
                    confidence: Some(100.0),
                    bbox: BoundingBox {
                        left: column as u32 * CHAR_WIDTH,
                        top: line_idx as u32 * LINE_HEIGHT,
                        width: token.chars().count() as u32 * CHAR_WIDTH,
                        height: LINE_HEIGHT,
                    },
                });
            }
            column += token.chars().count() + 1;
        }
    }
    words
}

#[async_trait]
impl OcrEngine for EchoEngine {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn load(&mut self) -> Result<(), EngineError> {
        self.setup_delay().await;
        if self.behavior.fail_load {
            return Err(EngineError::Fatal(anyhow!("echo engine configured to fail")));
        }
        self.loaded = true;
        Ok(())
    }

    async fn load_language(&mut self, language: &str) -> Result<(), EngineError> {
        self.setup_delay().await;
        if self.behavior.missing_languages.iter().any(|l| l == language) {
            return Err(EngineError::Fatal(anyhow!(
                "no model data for language {language:?}"
            )));
        }
        if !self.languages.iter().any(|l| l == language) {
            self.languages.push(language.to_owned());
        }
        Ok(())
    }

    async fn initialize(&mut self, languages: &[String]) -> Result<(), EngineError> {
        self.setup_delay().await;
        if !self.loaded {
            return Err(EngineError::Fatal(anyhow!("echo engine was never loaded")));
        }
        if let Some(missing) = languages.iter().find(|l| !self.languages.contains(l)) {
            return Err(EngineError::Fatal(anyhow!(
                "language {missing:?} was never loaded"
            )));
        }
        Ok(())
    }

    async fn recognize(
        &mut self,
        image: &ImageData,
        _languages: &[String],
    ) -> Result<EngineOutput, EngineError> {
        if !self.behavior.latency.is_zero() {
            time::sleep(self.behavior.latency).await;
        }

        let text = String::from_utf8_lossy(image.bytes()).into_owned();
        let command = text.trim_start();
        if command.starts_with("!fail") {
            return Err(EngineError::Transient(anyhow!("echo engine asked to fail")));
        } else if command.starts_with("!fatal") {
            return Err(EngineError::Fatal(anyhow!("echo engine asked to crash")));
        } else if command.starts_with("!panic") {
            panic!("echo engine asked to panic");
        } else if command.starts_with("!hang") {
            std::future::pending::<()>().await;
        }

        let words = grid_words(&text);
        Ok(EngineOutput::from_words(text, words))
    }

    async fn terminate(&mut self) -> Result<(), EngineError> {
        self.loaded = false;
        self.languages.clear();
        Ok(())
    }
}

// We focus on testing the "sad paths", because the happy path is exercised by
// the scheduler tests.
#[cfg(test)]
mod tests {
    use super::*;

    fn image(text: &str) -> ImageData {
        ImageData::new(text.as_bytes().to_vec())
    }

    async fn ready_engine() -> EchoEngine {
        let mut engine = EchoEngine::new(EchoBehavior::default());
        engine.load().await.unwrap();
        engine.load_language("eng").await.unwrap();
        engine.initialize(&["eng".to_owned()]).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn missing_language_fails_to_load() {
        let mut engine = EchoEngine::new(EchoBehavior {
            missing_languages: vec!["fra".to_owned()],
            ..EchoBehavior::default()
        });
        engine.load().await.unwrap();
        engine.load_language("eng").await.unwrap();
        assert!(engine.load_language("fra").await.is_err());
        assert!(engine.initialize(&["fra".to_owned()]).await.is_err());
    }

    #[tokio::test]
    async fn failure_prefixes_map_to_error_kinds() {
        let mut engine = ready_engine().await;
        let transient = engine.recognize(&image("!fail"), &[]).await.unwrap_err();
        assert!(!transient.is_fatal());
        let fatal = engine.recognize(&image("!fatal"), &[]).await.unwrap_err();
        assert!(fatal.is_fatal());
    }

    #[tokio::test]
    async fn words_are_laid_out_on_a_grid() {
        let mut engine = ready_engine().await;
        let output = engine
            .recognize(&image("HELLO  world\nagain"), &[])
            .await
            .unwrap();
        let texts = output.words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, ["HELLO", "world", "again"]);
        assert_eq!(output.words[1].bbox.left, 7 * CHAR_WIDTH);
        assert_eq!(output.words[2].bbox.top, LINE_HEIGHT);
        assert_eq!(output.confidence, Some(100.0));
    }
}
