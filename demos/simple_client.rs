//! # Simple Client Example
//!
//! Submits one request to a running server, follows it and downloads the result.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --example mock_server --features "server mock"
//! cargo run --example simple_client --features client -- scans/tile.las
//! ```

use addlidar::prelude::*;
use std::env;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let url = env::var("ADDLIDAR_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let client = AddLidarClient::new(url, env::var("ADDLIDAR_TOKEN").ok());

    let input = env::args().nth(1).unwrap_or_else(|| "scans/tile.las".to_string());
    let mut request = ProcessingRequest::new(input);
    request.format = Some("pcd-ascii".into());
    request.remove_color = true;

    let submitted = client.submit(&request).await?;
    let job_name = submitted.job_name.unwrap_or_default();
    println!("Submitted {job_name}");

    let last = client
        .watch(&job_name, |s| println!("{} ({}): {}", s.state, s.phase, s.message))
        .await?;

    match last {
        Some(s) if s.state == JobState::Succeeded => {
            let destination = PathBuf::from(format!("{job_name}.pcd"));
            let bytes = client.download(&job_name, &destination).await?;
            println!("Downloaded {bytes} bytes to {}", destination.display());
        }
        _ => println!("{}", client.logs(&job_name).await?),
    }

    client.delete(&job_name).await?;
    Ok(())
}
