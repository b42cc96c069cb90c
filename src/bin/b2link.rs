// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use b2link_client::client::B2Client;
use b2link_client::uploader::UploadRequest;
use b2link_config::client::ClientSpec;
use b2link_error::{Error, ResultExt, make_input_err};
use b2link_util::{init_tracing, spawn};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, trace_span};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Uploads files to B2 cloud storage and manages unfinished large files.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[clap(long, value_parser)]
    config: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authorizes the account and prints what the service returned.
    Authorize,

    /// Uploads a file, as a large file when it does not fit in one part.
    Upload {
        /// File to upload.
        #[clap(value_parser)]
        path: PathBuf,

        /// Bucket to upload to. Defaults to `default_bucket_id`.
        #[clap(long)]
        bucket: Option<String>,

        /// Name of the file in the bucket. Defaults to the local file name.
        #[clap(long)]
        name: Option<String>,

        #[clap(long)]
        content_type: Option<String>,

        /// Upload location lane, for running several uploads side by side.
        #[clap(long)]
        lane: Option<String>,

        /// Custom file info as `key=value`. May be repeated.
        #[clap(long = "info", value_parser = parse_file_info)]
        file_info: Vec<(String, String)>,
    },

    /// Lists large files that were started but never finished.
    ListUnfinished {
        #[clap(long)]
        bucket: Option<String>,

        /// Only list files whose name starts with this prefix.
        #[clap(long)]
        prefix: Option<String>,
    },

    /// Lists the uploaded parts of an unfinished large file.
    ListParts {
        #[clap(value_parser)]
        file_id: String,
    },

    /// Cancels an unfinished large file and discards its parts.
    Cancel {
        #[clap(value_parser)]
        file_id: String,
    },
}

fn parse_file_info(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("Expected key=value, got {value}"))
}

fn get_config(path: &Path) -> Result<ClientSpec, Error> {
    let json_contents = String::from_utf8(
        std::fs::read(path).err_tip(|| format!("Could not open config file {}", path.display()))?,
    )
    .map_err(|e| make_input_err!("Config file {} is not utf8: {e}", path.display()))?;
    Ok(serde_json5::from_str(&json_contents)?)
}

fn write_line(line: &str) -> Result<(), Error> {
    writeln!(std::io::stdout().lock(), "{line}")?;
    Ok(())
}

async fn inner_main(
    command: Command,
    spec: ClientSpec,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let client = B2Client::new(&spec)?;

    match command {
        Command::Authorize => {
            let auth = client.authorize(&cancel).await?;
            write_line(&format!("account_id: {}", auth.account_id))?;
            write_line(&format!("api_base_url: {}", auth.api_base_url))?;
            write_line(&format!("download_base_url: {}", auth.download_base_url))?;
            write_line(&format!(
                "recommended_part_size: {}",
                auth.recommended_part_size
            ))?;
            write_line(&format!(
                "absolute_min_part_size: {}",
                auth.absolute_min_part_size
            ))?;
        }
        Command::Upload {
            path,
            bucket,
            name,
            content_type,
            lane,
            file_info,
        } => {
            let file_name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or_else(|| make_input_err!("{} has no file name", path.display()))?,
            };
            let file = tokio::fs::File::open(&path)
                .await
                .err_tip(|| format!("Could not open {}", path.display()))?;
            let request = UploadRequest {
                bucket_id: bucket,
                file_name,
                content_type,
                file_info: file_info.into_iter().collect::<HashMap<_, _>>(),
                lane,
                large_file_sha1: None,
            };
            let uploaded = client.upload(&request, file, &cancel).await?;
            write_line(&serde_json::to_string_pretty(&uploaded)?)?;
        }
        Command::ListUnfinished { bucket, prefix } => {
            let files = client
                .large_files()
                .list_unfinished(bucket.as_deref(), prefix.as_deref(), &cancel)
                .await?;
            for file in files {
                write_line(&format!("{}\t{}", file.file_id, file.file_name))?;
            }
        }
        Command::ListParts { file_id } => {
            let parts = client.large_files().list_parts(&file_id, &cancel).await?;
            for part in parts {
                write_line(&format!(
                    "{}\t{}\t{}",
                    part.number, part.byte_length, part.checksum
                ))?;
            }
        }
        Command::Cancel { file_id } => {
            client.large_files().cancel_by_id(&file_id, &cancel).await?;
            write_line(&format!("cancelled {file_id}"))?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    init_tracing()?;

    let args = Args::parse();
    let spec = get_config(&args.config)?;

    #[allow(clippy::disallowed_methods)]
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        let cancel = CancellationToken::new();
        let cancel_on_signal = cancel.clone();
        runtime.block_on(async move {
            let _ctrl_c = spawn!("ctrl_c", async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    event!(Level::WARN, "User interrupted, cancelling");
                    cancel_on_signal.cancel();
                }
            });
            inner_main(args.command, spec, cancel)
                .instrument(trace_span!("main"))
                .await
        })
        .err_tip(|| "main() function failed")?;
    }
    Ok(())
}
