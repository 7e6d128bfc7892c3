//! Command-line entry points.

use clap::Args;
use futures::StreamExt as _;

use crate::async_utils::BoxedStream;

pub mod extract;
pub mod probe;

/// Common options for subcommands that process data streams.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Limit processing to the first N records.
    #[clap(long)]
    pub take_first: Option<usize>,

    /// Max number of documents to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub job_count: usize,

    /// What portion of documents should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,
}

impl StreamOpts {
    /// The worker concurrency to use, always at least 1.
    pub fn job_count(&self) -> usize {
        self.job_count.max(1)
    }

    /// Apply any necessary stream opts to our input stream.
    pub fn apply_stream_input_opts<T>(&self, input: BoxedStream<T>) -> BoxedStream<T>
    where
        T: 'static,
    {
        if let Some(take_first) = self.take_first {
            input.take(take_first).boxed()
        } else {
            input
        }
    }

    /// Options for in-process tests, with a configurable failure gate.
    #[cfg(test)]
    pub fn for_tests(allowed_failure_rate: f32) -> Self {
        Self {
            take_first: None,
            job_count: 2,
            allowed_failure_rate,
        }
    }
}
