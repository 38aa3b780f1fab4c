//! OCR engine interface.
//!
//! An [`OcrEngine`] is one stateful instance of a recognition engine. Every
//! worker in a [`crate::scheduler::Scheduler`] owns exactly one, created by an
//! [`OcrEngineFactory`], and drives it through `load`, `load_language`,
//! `initialize`, any number of `recognize` calls, and finally `terminate`.

use std::sync::{Arc, LazyLock};

use clap::{Args, ValueEnum};
use regex::Regex;
use schemars::JsonSchema;
use thiserror::Error;

use crate::{image_ref::ImageData, prelude::*, scheduler::WorkerId};

use self::{echo::EchoEngineFactory, tesseract::TesseractOpts};

pub mod echo;
pub mod tesseract;

/// Errors reported by an engine.
///
/// The distinction matters to the scheduler: a worker whose engine returns
/// [`EngineError::Fatal`] is taken out of service, while a worker that
/// returns [`EngineError::Transient`] keeps accepting jobs.
#[derive(Debug, Error)]
pub enum EngineError {
    /// This request failed, but the engine instance is still usable.
    #[error("{0:#}")]
    Transient(anyhow::Error),

    /// The engine instance is no longer usable.
    #[error("engine is unusable: {0:#}")]
    Fatal(anyhow::Error),
}

impl EngineError {
    /// Does this error mean the engine instance must be discarded?
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

/// A rectangle in image pixel coordinates.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// A single recognized word.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct RecognizedWord {
    /// The text of the word.
    pub text: String,

    /// Engine confidence, from 0 to 100, if the engine reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    /// Where the word appears in the image.
    pub bbox: BoundingBox,
}

/// What an engine returns for a single image.
#[derive(Clone, Debug, Default)]
pub struct EngineOutput {
    /// The full extracted text.
    pub text: String,

    /// Mean confidence over all words, if known.
    pub confidence: Option<f32>,

    /// Per-word details, if the engine provides them.
    pub words: Vec<RecognizedWord>,
}

impl EngineOutput {
    /// Build an output from words, computing the mean confidence.
    pub fn from_words(text: String, words: Vec<RecognizedWord>) -> Self {
        let confidences = words.iter().filter_map(|w| w.confidence).collect::<Vec<_>>();
        let confidence = if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f32>() / confidences.len() as f32)
        };
        Self {
            text,
            confidence,
            words,
        }
    }
}

/// Interface to one OCR engine instance.
///
/// Engines are only ever called by the single worker task that owns them, so
/// methods take `&mut self` and never run concurrently.
#[async_trait]
pub trait OcrEngine: Send + 'static {
    /// A short name for logging.
    fn name(&self) -> &'static str;

    /// Start the engine instance.
    async fn load(&mut self) -> Result<(), EngineError>;

    /// Fetch and prepare the model data for `language`.
    async fn load_language(&mut self, language: &str) -> Result<(), EngineError>;

    /// Finish setup. `languages` lists every loaded language, primary first.
    async fn initialize(&mut self, languages: &[String]) -> Result<(), EngineError>;

    /// Recognize text in an image. An empty `languages` means "use the
    /// languages passed to `initialize`".
    async fn recognize(
        &mut self,
        image: &ImageData,
        languages: &[String],
    ) -> Result<EngineOutput, EngineError>;

    /// Release everything the engine holds.
    async fn terminate(&mut self) -> Result<(), EngineError>;
}

/// Creates one engine per worker.
pub trait OcrEngineFactory: Send + Sync + 'static {
    /// Create a fresh, unloaded engine for `worker`.
    fn create_engine(&self, worker: WorkerId) -> Box<dyn OcrEngine>;
}

/// Language codes look like `eng`, `chi_sim` or `deu_latf`.
static LANGUAGE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("failed to compile regex")
});

/// Is `language` a plausible language code?
pub fn is_valid_language_code(language: &str) -> bool {
    LANGUAGE_CODE_RE.is_match(language)
}

/// Our different engine types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum EngineType {
    /// The `tesseract` command-line tool.
    #[default]
    Tesseract,

    /// Treat image bytes as UTF-8 text. For testing pipelines.
    Echo,
}

/// Engine-related options.
#[derive(Args, Clone, Debug)]
pub struct EngineOpts {
    /// The OCR engine to use.
    #[clap(long, value_enum, env = "OCR_POOL_ENGINE", default_value_t = EngineType::default())]
    pub engine: EngineType,

    #[clap(flatten)]
    pub tesseract: TesseractOpts,
}

impl EngineOpts {
    /// Build a factory for the selected engine.
    pub fn create_factory(&self) -> Result<Arc<dyn OcrEngineFactory>> {
        match self.engine {
            EngineType::Tesseract => Ok(Arc::new(
                tesseract::TesseractOcrEngineFactory::new(self.tesseract.clone())?,
            )),
            EngineType::Echo => Ok(Arc::new(EchoEngineFactory::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_codes_are_validated() {
        assert!(is_valid_language_code("eng"));
        assert!(is_valid_language_code("chi_sim"));
        assert!(!is_valid_language_code(""));
        assert!(!is_valid_language_code("eng+fra"));
        assert!(!is_valid_language_code("../eng"));
    }

    #[test]
    fn mean_confidence_ignores_missing_values() {
        let word = |text: &str, confidence| RecognizedWord {
            text: text.to_owned(),
            confidence,
            bbox: BoundingBox {
                left: 0,
                top: 0,
                width: 1,
                height: 1,
            },
        };
        let output = EngineOutput::from_words(
            "a b c".to_owned(),
            vec![word("a", Some(90.0)), word("b", None), word("c", Some(70.0))],
        );
        assert_eq!(output.confidence, Some(80.0));

        let empty = EngineOutput::from_words(String::new(), vec![]);
        assert_eq!(empty.confidence, None);
    }
}
