//! Job submission command.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use super::http::{base_url, post_json_body};

#[derive(Serialize)]
struct JobRequest {
    operation: String,
    matrix: Vec<Vec<i32>>,
}

#[derive(Deserialize)]
struct JobReport {
    job_id: u64,
    state: String,
    rows: Vec<Option<Vec<i32>>>,
    unresolved: Vec<i32>,
    elapsed_ms: u64,
}

/// Parse a matrix given on the command line, e.g. `[[1,2],[3,4]]`.
fn parse_matrix(text: &str) -> Result<Vec<Vec<i32>>> {
    serde_json::from_str(text).context("matrix must be a JSON array of integer arrays")
}

pub async fn cmd_multiply(port: u16, matrix: &str, operation: &str) -> Result<()> {
    let matrix = parse_matrix(matrix)?;
    let req = JobRequest {
        operation: operation.to_string(),
        matrix,
    };

    let report: JobReport = post_json_body(&format!("{}/jobs", base_url(port)), &req).await?;

    println!("═══════════════════════════════════════");
    println!("  Job {} — {}", report.job_id, report.state);
    println!("═══════════════════════════════════════");
    println!("  Elapsed : {} ms", report.elapsed_ms);
    for (i, row) in report.rows.iter().enumerate() {
        match row {
            Some(values) => println!("  [{}] {:?}", i, values),
            None => println!("  [{}] (no result)", i),
        }
    }

    if !report.unresolved.is_empty() {
        bail!(
            "job {} finished {} with unresolved rows {:?}",
            report.job_id,
            report.state,
            report.unresolved
        );
    }
    Ok(())
}
