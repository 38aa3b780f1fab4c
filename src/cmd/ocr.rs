//! The `ocr` subcommand.

use std::sync::{Arc, Mutex};

use clap::Args;
use futures::{StreamExt as _, stream};
use schemars::JsonSchema;

use crate::{
    async_utils::io::write_output,
    handler::{PoolSettings, wait_with_retries},
    image_ref::ImageRef,
    prelude::*,
    scheduler::{JobOptions, RecognitionResult, Scheduler},
    ui::{ProgressConfig, Ui},
};

use super::PoolOpts;

/// Most workers we start by default. Each one runs its own engine process.
const MAX_DEFAULT_WORKERS: usize = 4;

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Images to recognize: local paths, or `http(s)://`, `file://` or
    /// `data:` URLs.
    #[clap(value_name = "IMAGE", required = true)]
    pub images: Vec<String>,

    #[clap(flatten)]
    pub pool: PoolOpts,

    /// What portion of images should we allow to fail? Specified as a number
    /// between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,

    /// Output location, in JSONL format. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Did we recognize an image?
#[derive(Clone, Copy, Debug, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    Ok,
    Failed,
}

/// One line of `ocr` output.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct OcrRecord {
    /// The image, as given on the command line.
    pub image: String,

    /// Did recognition succeed?
    pub status: OcrStatus,

    /// Why recognition failed.
    pub errors: Vec<String>,

    /// The recognition result, if we have one.
    #[serde(flatten)]
    pub result: Option<RecognitionResult>,
}

/// How many images we processed, and how many failed.
#[derive(Clone, Copy, Debug, Default)]
struct OcrCounters {
    total: usize,
    failures: usize,
}

impl OcrCounters {
    /// Check our failure rate against `allowed_failure_rate`.
    fn finish(self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        if self.total == 0 {
            return Ok(());
        }
        let failure_rate = self.failures as f32 / self.total as f32;
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of images could not be recognized, but only {:.2}% were allowed",
                self.failures,
                self.total,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            if self.failures > 0 {
                ui.display_message(
                    "❌",
                    &format!("{} images could not be recognized", self.failures),
                );
            }
            Ok(())
        }
    }
}

/// The default worker count for this machine.
fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_WORKERS)
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let factory = opts.pool.engine.create_factory()?;
    let settings = opts.pool.settings(default_worker_count());
    let scheduler = Scheduler::new(factory, settings.config.clone());

    // Always shut the pool down, even if something went wrong.
    let result = recognize_all(&ui, &scheduler, &settings, opts).await;
    scheduler.terminate().await;
    result
}

/// Recognize every image on our command line with `scheduler`.
async fn recognize_all(
    ui: &Ui,
    scheduler: &Scheduler,
    settings: &PoolSettings,
    opts: &OcrOpts,
) -> Result<()> {
    let ready = scheduler
        .initialize(settings.workers, &settings.languages)
        .await?;
    debug!(pool = ?scheduler.snapshot(), "Pool started");
    if !ready.failures.is_empty() {
        ui.display_message(
            "⚠️",
            &format!(
                "{} of {} OCR workers failed to start",
                ready.failures.len(),
                settings.workers
            ),
        );
    }

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔎",
            msg: "Recognizing images",
            done_msg: "Recognized images",
        },
        opts.images.len() as u64,
    );

    // Queue everything up front. The scheduler hands images to workers in
    // order, and we write results in the same order.
    let options = JobOptions::default();
    let jobs = opts
        .images
        .iter()
        .map(|arg| {
            let image = ImageRef::parse(arg);
            let handle = scheduler.submit(image.clone(), options.clone());
            let options = options.clone();
            async move {
                let result =
                    wait_with_retries(scheduler, handle, &image, &options, settings.retries)
                        .await;
                match result {
                    Ok(result) => OcrRecord {
                        image: arg.clone(),
                        status: OcrStatus::Ok,
                        errors: vec![],
                        result: Some(result),
                    },
                    Err(err) => {
                        warn!(%image, %err, "Could not recognize image");
                        OcrRecord {
                            image: arg.clone(),
                            status: OcrStatus::Failed,
                            errors: vec![err.to_string()],
                            result: None,
                        }
                    }
                }
            }
        })
        .collect::<Vec<_>>();

    let counters = Arc::new(Mutex::new(OcrCounters::default()));
    let counters_clone = counters.clone();
    let output = pb
        .wrap_stream(stream::iter(jobs).buffered(opts.images.len().max(1)))
        .map(move |record| {
            let mut counters = counters_clone.lock().expect("lock poisoned");
            counters.total += 1;
            if record.status != OcrStatus::Ok {
                counters.failures += 1;
            }
            serde_json::to_value(&record).context("failed to serialize output")
        });
    write_output(opts.output_path.as_deref(), output).await?;

    let counters = *counters.lock().expect("lock poisoned");
    counters.finish(ui, opts.allowed_failure_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_rate_is_enforced() {
        let ui = Ui::init_for_tests();
        let counters = OcrCounters {
            total: 4,
            failures: 1,
        };
        assert!(counters.finish(&ui, 0.25).is_ok());
        assert!(counters.finish(&ui, 0.1).is_err());
        assert!(OcrCounters::default().finish(&ui, 0.0).is_ok());
    }

    #[test]
    fn failed_records_omit_results() {
        let record = OcrRecord {
            image: "missing.png".to_owned(),
            status: OcrStatus::Failed,
            errors: vec!["cannot load image".to_owned()],
            result: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json.get("text").is_none());
    }
}
