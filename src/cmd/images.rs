//! The `images` subcommand: manage stored images, and OCR them.

use clap::{Args, Subcommand};

use crate::{
    async_utils::io::write_json,
    blob_store::id_from_cli,
    handler::{self, HandlerError, Response},
    prelude::*,
};

use super::{PoolOpts, StoreOpts};

/// Default number of workers for `images get`. One image doesn't need many.
const DEFAULT_GET_WORKERS: usize = 2;

/// `images` command line arguments.
#[derive(Debug, Args)]
pub struct ImagesOpts {
    #[clap(flatten)]
    pub store: StoreOpts,

    /// Output location for the JSON response. Defaults to standard output.
    #[clap(short = 'o', long = "out", global = true)]
    pub output_path: Option<PathBuf>,

    #[clap(subcommand)]
    pub subcmd: ImagesCmd,
}

/// Things we can do with stored images.
#[derive(Debug, Subcommand)]
pub enum ImagesCmd {
    /// Store a PNG or JPEG image.
    Upload {
        /// The image file to upload.
        path: PathBuf,
    },
    /// List stored images.
    List,
    /// Fetch a stored image and extract its text.
    Get {
        /// The image id. `:` may be used in place of `/`.
        id: String,

        #[clap(flatten)]
        pool: PoolOpts,
    },
    /// Delete a stored image.
    Delete {
        /// The image id. `:` may be used in place of `/`.
        id: String,
    },
}

/// The `images` subcommand.
///
/// Responses are written as `{"message":"Success","result":...}`. Failures are
/// written as `{"message":"Error","status":...,"error":...}`, and also
/// returned as an error so that we exit with a non-zero status.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_images(opts: &ImagesOpts) -> Result<()> {
    let store = opts.store.open()?;
    let output_path = opts.output_path.as_deref();
    match &opts.subcmd {
        ImagesCmd::Upload { path } => {
            respond(output_path, handler::upload_image(&store, path).await).await
        }
        ImagesCmd::List => respond(output_path, handler::list_images(&store).await).await,
        ImagesCmd::Get { id, pool } => {
            let factory = pool.engine.create_factory()?;
            let settings = pool.settings(DEFAULT_GET_WORKERS);
            let result =
                handler::get_image_with_text(&store, factory, &settings, &id_from_cli(id))
                    .await;
            respond(output_path, result).await
        }
        ImagesCmd::Delete { id } => {
            let result = handler::delete_image(&store, &id_from_cli(id))
                .await
                .map(|()| serde_json::json!({ "id": id_from_cli(id) }));
            respond(output_path, result).await
        }
    }
}

/// Write a response envelope, and turn failures into errors.
async fn respond<T>(output_path: Option<&Path>, result: Result<T, HandlerError>) -> Result<()>
where
    T: Serialize,
{
    let failure = result
        .as_ref()
        .err()
        .map(|err| anyhow!("request failed with status {}", err.status_code()));
    write_json(output_path, &Response::from(result)).await?;
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
