use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Error};
use clap::Parser;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use interview_ingest::config::{Command, ConfigContext};
use interview_ingest::db::DbHandle;
use interview_ingest::ingest::{self, Submission, SubmissionOutcome};
use interview_ingest::interviews::InterviewStore;
use interview_ingest::storage::LocalBlobStore;
use interview_ingest::{media, server, telemetry, MediaPayload, Modality, Pipeline};

async fn connect(config: &ConfigContext) -> Result<Pipeline, Error> {
    let db = DbHandle::new(&config.connect_url, config.db_connections).await?;
    let blobs = Arc::new(LocalBlobStore::new(
        config.pipeline.blob_root.clone(),
        config.pipeline.blob_base_url.clone(),
    ));
    Ok(Pipeline::postgres(&db, blobs, config.pipeline.settings()))
}

async fn read_payload(path: &Path, expected: Modality) -> Result<MediaPayload, Error> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))?
        .to_string();
    let media_type = match media::guess_media_type(&filename) {
        Some((modality, media_type)) if modality == expected => media_type.to_string(),
        _ => return Err(anyhow!("{filename} is not a supported {expected} file")),
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(MediaPayload {
        bytes,
        filename,
        media_type,
    })
}

#[instrument(skip(cancel_token, pipeline))]
async fn serve(cancel_token: CancellationToken, pipeline: Pipeline, num: u16) -> Result<(), Error> {
    // Channel for getting notifications from the dispatcher
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                if let Err(err) = server::serve(cancel_token, pipeline, num, send_to_client).await {
                    error!("Error running server: {}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            server_response = recv_from_server.recv() => {
                match server_response {
                    Some(msg) => {
                        info!(event = "Message", msg = ?msg);
                    },
                    None => {
                        debug!("Server connection closed, exiting");
                        break;
                    }
                }
            }
        }
    }

    info!("Waiting for server to shutdown...");
    server_spawn.await?;

    Ok(())
}

async fn run(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let pipeline = connect(&config).await?;

    match config.command {
        Command::Serve { num } => serve(cancel_token, pipeline, num).await,
        Command::Submit {
            interview_id,
            question_index,
            audio,
            video,
        } => {
            let audio = match audio {
                Some(path) => Some(read_payload(&path, Modality::Audio).await?),
                None => None,
            };
            let video = match video {
                Some(path) => Some(read_payload(&path, Modality::Video).await?),
                None => None,
            };
            let submission = Submission {
                interview_id,
                question_index,
                audio,
                video,
            };
            match ingest::submit(&pipeline, submission).await? {
                SubmissionOutcome::Accepted {
                    job_id,
                    accepted,
                    duplicates,
                } => {
                    println!("accepted: job {job_id} carries {accepted:?}");
                    if !duplicates.is_empty() {
                        println!("rejected as duplicate-submission: {duplicates:?}");
                    }
                }
                SubmissionOutcome::Rejected(reason) => println!("rejected: {reason}"),
            }
            Ok(())
        }
        Command::CreateInterview { questions } => {
            let interview = pipeline.interviews.create(questions).await?;
            println!("{}", interview.id);
            Ok(())
        }
        Command::Status { interview_id } => {
            let interview = pipeline
                .interviews
                .get(interview_id)
                .await?
                .ok_or_else(|| anyhow!("interview {interview_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&interview)?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "interview_ingest=DEBUG");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(run(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });
    let result = app.await?;
    info!("Shutting down.");
    telemetry::shutdown();

    result.map_err(Into::into)
}
