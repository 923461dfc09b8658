use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use common::job::{CompactionRequest, IngestionSchema, LockGranularity};
use common::segment::Granularity;
use common::{DataSegment, IngestionSpec, Interval, JobInfo, JobStatus};

#[derive(Debug, Parser)]
#[command(name = "client")]
#[command(about = "CLI para mandar jobs de ingesta y compactación al supervisor")]
pub struct Cli {
    /// URL base del supervisor.
    /// - En Docker: SUPERVISOR_URL=http://supervisor:8080
    #[arg(long, env = "SUPERVISOR_URL", default_value = "http://localhost:8080")]
    pub url: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Envía un job de ingesta descrito en un archivo JSON
    Submit {
        #[arg(value_name = "SPEC_JSON")]
        spec: PathBuf,

        /// Espera a que el job termine
        #[arg(long)]
        wait: bool,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Compacta los segmentos de un intervalo
    Compact {
        datasource: String,

        /// `inicio/fin` o `inicio/periodo`, p.ej. 2020-01-01/P1D
        interval: Interval,

        /// Schema JSON de los segmentos
        #[arg(long)]
        schema: PathBuf,

        /// Lock por segmento en lugar de por time chunk
        #[arg(long)]
        segment_lock: bool,

        /// HOUR, DAY, MONTH o YEAR
        #[arg(long, default_value = "DAY", value_parser = parse_granularity)]
        granularity: Granularity,

        #[arg(long)]
        wait: bool,
    },
    /// Lista los segmentos publicados de un datasource
    Segments { datasource: String },
}

fn parse_granularity(s: &str) -> std::result::Result<Granularity, String> {
    serde_json::from_value(serde_json::Value::String(s.to_uppercase()))
        .map_err(|_| format!("granularidad desconocida: {s}"))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("JSON inválido en {}", path.display()))
}

async fn parse_response<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    match body.get("error").and_then(|e| e.as_str()) {
        Some(message) => bail!("{status}: {message}"),
        None => bail!("el supervisor respondió {status}"),
    }
}

struct Api {
    http: Client,
    base_url: String,
}

impl Api {
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        parse_response(resp).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Consulta el job hasta que quede en un estado final.
    async fn wait_for(&self, id: &str) -> Result<JobInfo> {
        loop {
            let job: JobInfo = self.get(&format!("/api/v1/jobs/{id}")).await?;
            if matches!(job.status, JobStatus::Succeeded | JobStatus::Failed) {
                return Ok(job);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  datasource: {}", job.datasource);
    println!("  estado: {:?}", job.status);
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref done) = job.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(ref error) = job.error {
        println!("  error: {}", error);
    }
    if let Some(ref report) = job.report {
        for (phase, totals) in &report.row_stats {
            println!(
                "  filas [{phase}]: procesadas={}, con error={}, descartadas={}, no parseables={}",
                totals.processed, totals.processed_with_error, totals.thrown_away, totals.unparseable
            );
        }
        println!("  segmentos publicados: {}", report.segments.len());
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let api = Api {
        http: Client::new(),
        base_url: cli.url.trim_end_matches('/').to_string(),
    };

    match cli.command {
        Commands::Submit { spec, wait } => {
            let spec: IngestionSpec = read_json(&spec)?;
            let job: JobInfo = api.post("/api/v1/jobs", &spec).await?;
            println!("Job creado: {}", job.id);
            let job = if wait { api.wait_for(&job.id).await? } else { job };
            print_job(&job);
        }

        Commands::Status { id } => {
            let job: JobInfo = api.get(&format!("/api/v1/jobs/{id}")).await?;
            print_job(&job);
        }

        Commands::Compact {
            datasource,
            interval,
            schema,
            segment_lock,
            granularity,
            wait,
        } => {
            let schema: IngestionSchema = read_json(&schema)?;
            let request = CompactionRequest {
                datasource,
                interval,
                lock_granularity: if segment_lock {
                    LockGranularity::Segment
                } else {
                    LockGranularity::TimeChunk
                },
                segment_granularity: granularity,
                tuning: None,
                schema,
            };
            let job: JobInfo = api.post("/api/v1/compactions", &request).await?;
            println!("Compactación creada: {}", job.id);
            let job = if wait { api.wait_for(&job.id).await? } else { job };
            print_job(&job);
        }

        Commands::Segments { datasource } => {
            let segments: Vec<DataSegment> = api
                .get(&format!("/api/v1/datasources/{datasource}/segments"))
                .await?;
            if segments.is_empty() {
                println!("No hay segmentos publicados para {datasource}.");
            }
            for s in segments {
                println!("{}  filas={}  {}", s.id, s.num_rows, s.path);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_compact_con_lock_por_segmento() {
        let cli = Cli::try_parse_from([
            "client",
            "--url",
            "http://sup:8080",
            "compact",
            "wiki",
            "2020-01-01/P1D",
            "--schema",
            "schema.json",
            "--segment-lock",
            "--granularity",
            "hour",
        ])
        .unwrap();
        assert_eq!(cli.url, "http://sup:8080");
        match cli.command {
            Commands::Compact {
                datasource,
                interval,
                segment_lock,
                granularity,
                wait,
                ..
            } => {
                assert_eq!(datasource, "wiki");
                assert_eq!(interval, "2020-01-01/2020-01-02".parse().unwrap());
                assert!(segment_lock);
                assert!(!wait);
                assert_eq!(granularity, Granularity::Hour);
            }
            other => panic!("comando inesperado: {other:?}"),
        }
    }

    #[test]
    fn intervalo_invalido_se_rechaza() {
        let parsed = Cli::try_parse_from([
            "client",
            "compact",
            "wiki",
            "2020-01-01",
            "--schema",
            "s.json",
        ]);
        assert!(parsed.is_err());
        assert!(parse_granularity("semana").is_err());
    }
}
