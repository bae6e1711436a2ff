use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use tally::{
    accumulator::Accumulator,
    config::Config,
    operation::{LoopBody, Reduction},
    runtime::Runtime,
    RemoteExecute,
};
use tracing::{info, warn};

mod init;

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// Upper bound of the range `1..=N` to compute over.
    #[arg(long, default_value_t = 1_000)]
    pub len: i64,

    /// Make the loop body fail at this index, to show failure propagation.
    #[arg(long)]
    pub fail_at: Option<i64>,
}

/// Sums `2i + 100` and counts multiples of seven.
#[derive(Serialize, Deserialize, RemoteExecute)]
#[tally(body)]
struct Affine {
    total: Accumulator<i64>,
    sevens: Accumulator<u64>,
    fail_at: Option<i64>,
}

impl LoopBody for Affine {
    fn execute(&self, index: i64) -> anyhow::Result<()> {
        if self.fail_at == Some(index) {
            anyhow::bail!("refusing to process index {index}");
        }
        self.total.update(|total| *total += 2 * index + 100);
        if index % 7 == 0 {
            self.sevens.update(|sevens| *sevens += 1);
        }
        Ok(())
    }
}

/// Joins the decimal digits of every index, in range order.
#[derive(Serialize, Deserialize, RemoteExecute)]
#[tally(reduction)]
struct Digits;

impl Reduction for Digits {
    type Elem = String;

    fn map(&self, index: i64) -> anyhow::Result<String> {
        Ok(index.to_string())
    }

    fn combine(&self, a: String, b: String) -> anyhow::Result<String> {
        Ok(a + &b)
    }

    fn empty(&self) -> String {
        String::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();

    let args = Cli::parse();
    let runtime = Runtime::from_config(&args.options).await?;
    info!(workers = ?runtime.workers(), "cluster ready");

    let body = Affine {
        total: runtime.accumulator(0),
        sevens: runtime.accumulator(0),
        fail_at: args.fail_at,
    };

    match runtime.parallel_for(&body, 1..=args.len).await {
        Ok(()) => {
            let total = body.total.reduce(|a, b| a + b).await?;
            let sevens = body.sevens.reduce(|a, b| a + b).await?;
            info!(total, sevens, "parallel for finished");
        }
        Err(err) => {
            warn!(%err, "parallel for failed");
            // Reduction still terminates, and reports the same workers.
            if let Err(err) = body.total.reduce(|a, b| a + b).await {
                warn!(failed = ?err.failed_workers(), "reduction aborted");
            }
        }
    }

    let digits = runtime.parallel_reduce(&Digits, 1..=args.len.min(20)).await?;
    info!(%digits, "parallel reduce finished");

    Ok(())
}
