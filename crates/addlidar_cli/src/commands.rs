use addlidar_client::AddLidarClient;
use addlidar_core::prelude::*;

use anyhow::bail;
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum ClientCommand {
    /// Submit a processing request and print the job name.
    Submit(SubmitArgs),
    /// Print the current status of a job.
    Status { job_name: String },
    /// Print every status change until the job is terminal.
    Watch { job_name: String },
    /// List the jobs tracked by the server.
    List,
    /// Print the container output of a job.
    Logs { job_name: String },
    /// Save the output of a finished job.
    Download {
        job_name: String,
        /// Destination file, `<job_name>.out` by default.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Cancel a job and remove it from the server.
    Delete { job_name: String },
}

#[derive(Args)]
pub struct SubmitArgs {
    /// Input file, relative to the data volume.
    pub input_file: String,

    /// Output format, e.g. `las`, `laz`, `pcd-ascii`.
    #[arg(short, long)]
    pub format: Option<String>,

    #[arg(long)]
    pub remove_color: bool,

    #[arg(long)]
    pub remove_all_attributes: bool,

    /// Attribute to drop. Repeatable.
    #[arg(long, value_name = "NAME")]
    pub remove_attribute: Vec<String>,

    /// Flight line index.
    #[arg(long)]
    pub line: Option<u32>,

    /// Maximum return index.
    #[arg(long)]
    pub returns: Option<u32>,

    /// Maximum number of points.
    #[arg(long)]
    pub number: Option<u64>,

    /// Maximum point density.
    #[arg(long)]
    pub density: Option<f64>,

    /// Region of interest as `min_x,min_y,max_x,max_y`.
    #[arg(long, allow_hyphen_values = true)]
    pub roi: Option<RegionOfInterest>,

    #[arg(long)]
    pub outcrs: Option<String>,

    #[arg(long)]
    pub incrs: Option<String>,

    /// Follow the job until it finishes.
    #[arg(short, long)]
    pub watch: bool,
}

impl SubmitArgs {
    pub fn into_request(self) -> ProcessingRequest {
        ProcessingRequest {
            input_file: self.input_file,
            remove_attribute: self.remove_attribute,
            remove_all_attributes: self.remove_all_attributes,
            remove_color: self.remove_color,
            format: self.format,
            line: self.line,
            returns: self.returns,
            number: self.number,
            density: self.density,
            roi: self.roi,
            outcrs: self.outcrs,
            incrs: self.incrs,
        }
    }
}

pub async fn run(client: &AddLidarClient, command: ClientCommand) -> anyhow::Result<()> {
    match command {
        ClientCommand::Submit(args) => {
            let watch = args.watch;
            let response = client.submit(&args.into_request()).await?;
            let Some(job_name) = response.job_name else {
                bail!("Server accepted the request without naming a job");
            };
            println!("{job_name}");
            if watch {
                follow(client, &job_name).await?;
            }
        }
        ClientCommand::Status { job_name } => {
            let snapshot = client.status(&job_name).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        ClientCommand::Watch { job_name } => follow(client, &job_name).await?,
        ClientCommand::List => {
            for snapshot in client.list().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    snapshot.job_name, snapshot.state, snapshot.phase, snapshot.message
                );
            }
        }
        ClientCommand::Logs { job_name } => print!("{}", client.logs(&job_name).await?),
        ClientCommand::Download { job_name, output } => {
            let destination = output.unwrap_or_else(|| PathBuf::from(format!("{job_name}.out")));
            let written = client.download(&job_name, &destination).await?;
            eprintln!("Wrote {written} bytes to {}", destination.display());
        }
        ClientCommand::Delete { job_name } => {
            client.delete(&job_name).await?;
            eprintln!("Deleted {job_name}");
        }
    }
    Ok(())
}

async fn follow(client: &AddLidarClient, job_name: &str) -> anyhow::Result<()> {
    let last = client
        .watch(job_name, |snapshot| {
            println!(
                "[{}] {} ({}): {}",
                snapshot.timestamp.to_rfc3339(),
                snapshot.state,
                snapshot.phase,
                snapshot.message
            );
        })
        .await?;

    match last {
        Some(snapshot) if snapshot.state == JobState::Succeeded => Ok(()),
        Some(snapshot) => bail!("Job {job_name} ended as {}", snapshot.state),
        None => bail!("Connection closed before any status was received"),
    }
}
