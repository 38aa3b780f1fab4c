//! Tesseract OCR engine.
//!
//! Each engine instance drives the `tesseract` CLI tool. "Loading" checks that
//! the binary runs, and "loading a language" makes sure the `.traineddata`
//! file is available, downloading it if we manage our own tessdata directory.

use std::{collections::HashSet, io::Write as _, process::Stdio, sync::Arc};

use clap::Args;
use tempfile::{NamedTempFile, TempDir};
use tokio::{process::Command, sync::Mutex};

use crate::{
    async_utils::check_for_command_failure, image_ref::ImageData, prelude::*,
    scheduler::WorkerId,
};

use super::{
    BoundingBox, EngineError, EngineOutput, OcrEngine, OcrEngineFactory, RecognizedWord,
};

/// Where we download missing language data from.
const DEFAULT_TESSDATA_URL: &str =
    "https://github.com/tesseract-ocr/tessdata_fast/raw/main";

/// Tesseract's TSV output marks word rows with this level.
const TSV_WORD_LEVEL: &str = "5";

/// Tesseract-specific options.
#[derive(Args, Clone, Debug)]
pub struct TesseractOpts {
    /// The `tesseract` binary to run.
    #[clap(long, env = "TESSERACT_PATH", default_value = "tesseract")]
    pub tesseract_path: PathBuf,

    /// A directory of `*.traineddata` files to use instead of the system
    /// language data. Missing languages are downloaded into it.
    #[clap(long, env = "OCR_POOL_TESSDATA_DIR")]
    pub tessdata_dir: Option<PathBuf>,

    /// Base URL for downloading `<lang>.traineddata` files.
    #[clap(long, default_value = DEFAULT_TESSDATA_URL)]
    pub tessdata_url: String,

    /// Never download language data.
    #[clap(long)]
    pub no_download: bool,

    /// Tesseract page segmentation mode (`--psm`).
    #[clap(long, value_parser = clap::value_parser!(u8).range(0..=13))]
    pub psm: Option<u8>,
}

/// Creates [`TesseractOcrEngine`]s which share an HTTP client and a download
/// lock.
pub struct TesseractOcrEngineFactory {
    opts: Arc<TesseractOpts>,
    client: reqwest::Client,
    download_lock: Arc<Mutex<()>>,
}

impl TesseractOcrEngineFactory {
    /// Create a new factory.
    pub fn new(opts: TesseractOpts) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("cannot create HTTP client")?;
        Ok(Self {
            opts: Arc::new(opts),
            client,
            download_lock: Arc::new(Mutex::new(())),
        })
    }
}

impl OcrEngineFactory for TesseractOcrEngineFactory {
    fn create_engine(&self, worker: WorkerId) -> Box<dyn OcrEngine> {
        Box::new(TesseractOcrEngine {
            worker,
            opts: self.opts.clone(),
            client: self.client.clone(),
            download_lock: self.download_lock.clone(),
            scratch: None,
            system_languages: None,
            loaded_languages: vec![],
            languages: vec![],
        })
    }
}

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractOcrEngine {
    worker: WorkerId,
    opts: Arc<TesseractOpts>,
    client: reqwest::Client,
    download_lock: Arc<Mutex<()>>,

    /// Scratch directory for input and output files. Present while loaded.
    scratch: Option<TempDir>,

    /// Cached output of `tesseract --list-langs`.
    system_languages: Option<HashSet<String>>,

    /// Languages prepared by `load_language`.
    loaded_languages: Vec<String>,

    /// Languages passed to `initialize`, primary first.
    languages: Vec<String>,
}

impl TesseractOcrEngine {
    /// Build a `tesseract` command with our common options.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.opts.tesseract_path);
        if let Some(dir) = &self.opts.tessdata_dir {
            cmd.arg("--tessdata-dir").arg(dir);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Does the system `tesseract` have data for `language`?
    async fn has_system_language(&mut self, language: &str) -> Result<bool> {
        if self.system_languages.is_none() {
            let output = self
                .command()
                .arg("--list-langs")
                .output()
                .await
                .context("cannot run tesseract")?;
            check_for_command_failure("tesseract", &output)?;
            // The first line is a header like `List of available languages
            // in "/usr/share/tessdata/" (3):`.
            let stdout = String::from_utf8_lossy(&output.stdout);
            let languages = stdout
                .lines()
                .skip(1)
                .map(|line| line.trim().to_owned())
                .filter(|line| !line.is_empty())
                .collect();
            self.system_languages = Some(languages);
        }
        Ok(self
            .system_languages
            .as_ref()
            .is_some_and(|languages| languages.contains(language)))
    }

    /// Make sure `<dir>/<language>.traineddata` exists, downloading it if
    /// needed.
    #[instrument(level = "debug", skip(self, dir))]
    async fn ensure_traineddata(&self, dir: &Path, language: &str) -> Result<()> {
        let path = dir.join(format!("{language}.traineddata"));

        // Only one worker downloads at a time, so a pool starting up fetches
        // each language once.
        let _guard = self.download_lock.lock().await;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        if self.opts.no_download {
            return Err(anyhow!("missing {} and downloads are disabled", path.display()));
        }

        let url = format!(
            "{}/{}.traineddata",
            self.opts.tessdata_url.trim_end_matches('/'),
            language
        );
        info!(%url, "Downloading language data");
        let data = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("cannot download {url}"))?
            .bytes()
            .await
            .with_context(|| format!("cannot read {url}"))?;
        if data.is_empty() {
            return Err(anyhow!("downloaded empty language data from {url}"));
        }

        // Write to a temporary file and rename it, so a half-written file is
        // never mistaken for real language data.
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create {}", dir.display()))?;
        let dir = dir.to_owned();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)
                .context("cannot create temporary language data file")?;
            tmp.write_all(&data)
                .context("cannot write language data")?;
            tmp.persist(&path)
                .with_context(|| format!("cannot save {}", path.display()))?;
            Ok(())
        })
        .await
        .context("language data writer panicked")??;
        Ok(())
    }
}

/// Parse tesseract's TSV output into words.
fn parse_tsv(tsv: &str) -> Vec<RecognizedWord> {
    let mut words = vec![];
    // Columns: level page_num block_num par_num line_num word_num left top
    // width height conf text.
    for line in tsv.lines().skip(1) {
        let fields = line.splitn(12, '\t').collect::<Vec<_>>();
        if fields.len() < 12 || fields[0] != TSV_WORD_LEVEL {
            continue;
        }
        let text = fields[11].trim();
        if text.is_empty() {
            continue;
        }
        let number = |idx: usize| fields[idx].trim().parse::<u32>().ok();
        let (Some(left), Some(top), Some(width), Some(height)) =
            (number(6), number(7), number(8), number(9))
        else {
            trace!(line, "Skipping malformed tesseract TSV row");
            continue;
        };
        let confidence = fields[10]
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|conf| *conf >= 0.0);
        words.push(RecognizedWord {
            text: text.to_owned(),
            confidence,
            bbox: BoundingBox {
                left,
                top,
                width,
                height,
            },
        });
    }
    words
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    #[instrument(level = "debug", skip_all)]
    async fn load(&mut self) -> Result<(), EngineError> {
        debug!(worker = %self.worker, path = %self.opts.tesseract_path.display(), "Starting tesseract");
        let output = self
            .command()
            .arg("--version")
            .output()
            .await
            .with_context(|| {
                format!("cannot run {}", self.opts.tesseract_path.display())
            })
            .map_err(EngineError::Fatal)?;
        check_for_command_failure("tesseract", &output).map_err(EngineError::Fatal)?;
        let scratch = TempDir::with_prefix("tesseract")
            .context("cannot create tesseract scratch directory")
            .map_err(EngineError::Fatal)?;
        self.scratch = Some(scratch);
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn load_language(&mut self, language: &str) -> Result<(), EngineError> {
        match self.opts.tessdata_dir.clone() {
            Some(dir) => self
                .ensure_traineddata(&dir, language)
                .await
                .map_err(EngineError::Fatal)?,
            None => {
                let available = self
                    .has_system_language(language)
                    .await
                    .map_err(EngineError::Fatal)?;
                if !available {
                    return Err(EngineError::Fatal(anyhow!(
                        "tesseract has no data for language {language:?}"
                    )));
                }
            }
        }
        if !self.loaded_languages.iter().any(|l| l == language) {
            self.loaded_languages.push(language.to_owned());
        }
        Ok(())
    }

    async fn initialize(&mut self, languages: &[String]) -> Result<(), EngineError> {
        if self.scratch.is_none() {
            return Err(EngineError::Fatal(anyhow!("tesseract was never loaded")));
        }
        if let Some(missing) = languages
            .iter()
            .find(|l| !self.loaded_languages.contains(l))
        {
            return Err(EngineError::Fatal(anyhow!(
                "language {missing:?} was never loaded"
            )));
        }
        self.languages = languages.to_owned();
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn recognize(
        &mut self,
        image: &ImageData,
        languages: &[String],
    ) -> Result<EngineOutput, EngineError> {
        let scratch = self
            .scratch
            .as_ref()
            .ok_or_else(|| EngineError::Fatal(anyhow!("tesseract was never loaded")))?;
        let languages = if languages.is_empty() {
            &self.languages[..]
        } else {
            languages
        };
        if let Some(missing) = languages
            .iter()
            .find(|l| !self.loaded_languages.contains(l))
        {
            return Err(EngineError::Transient(anyhow!(
                "language {missing:?} is not loaded in this worker"
            )));
        }
        let extension = image.extension().ok_or_else(|| {
            EngineError::Transient(anyhow!(
                "cannot determine image type for {}",
                image.mime_type().unwrap_or("unknown data")
            ))
        })?;

        // Write our input to the scratch directory.
        let stem = uuid::Uuid::new_v4().to_string();
        let input_path = scratch.path().join(format!("{stem}.{extension}"));
        let output_base = scratch.path().join(&stem);
        tokio::fs::write(&input_path, image.bytes())
            .await
            .context("cannot write tesseract input file")
            .map_err(EngineError::Transient)?;

        // Run tesseract, asking for both plain text and TSV output. If this
        // future is dropped, `kill_on_drop` takes the process with it.
        let mut cmd = self.command();
        cmd.arg(&input_path)
            .arg(&output_base)
            .arg("-l")
            .arg(languages.join("+"));
        if let Some(psm) = self.opts.psm {
            cmd.arg("--psm").arg(psm.to_string());
        }
        cmd.arg("txt").arg("tsv");
        let output = cmd
            .output()
            .await
            .context("cannot run tesseract")
            .map_err(EngineError::Fatal)?;
        let result = check_for_command_failure("tesseract", &output)
            .map_err(EngineError::Transient);

        let txt_path = output_base.with_extension("txt");
        let tsv_path = output_base.with_extension("tsv");
        let read = async {
            result?;
            let text = tokio::fs::read_to_string(&txt_path)
                .await
                .context("cannot read tesseract output file")
                .map_err(EngineError::Transient)?;
            let tsv = tokio::fs::read_to_string(&tsv_path)
                .await
                .unwrap_or_default();
            Ok::<_, EngineError>(EngineOutput::from_words(text, parse_tsv(&tsv)))
        }
        .await;

        for path in [&input_path, &txt_path, &tsv_path] {
            let _ = tokio::fs::remove_file(path).await;
        }
        read
    }

    async fn terminate(&mut self) -> Result<(), EngineError> {
        self.loaded_languages.clear();
        self.languages.clear();
        if let Some(scratch) = self.scratch.take() {
            scratch
                .close()
                .context("cannot remove tesseract scratch directory")
                .map_err(EngineError::Transient)?;
        }
        Ok(())
    }
}
