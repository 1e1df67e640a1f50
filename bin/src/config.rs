//! demo configs

pub mod cli {
    //! Parse from either cli or env var

    /// default broker url
    pub static DEFAULT_NATS_URL: &str = "nats://nats1:4222";
    /// client name announced to the broker
    pub static DEFAULT_CONNECTION_NAME: &str = "NATS Demo";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "nats-demo-worker";
    /// default log level. Can use this argument or DEMO_LOG env var
    pub const DEFAULT_DEMO_LOG: &str = "info";
    /// messages sent by the `pub` role
    pub const DEFAULT_PUB_COUNT: usize = 100_000;
    /// reply deadline for the `req` role
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1_000;

    use std::time::Duration;

    use broker_client::ConnectionOptions;
    pub use clap::Parser;
    use clap::ValueEnum;

    /// Which side of the demo this process plays.
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Role {
        /// publish a burst of messages to `updates`
        Pub,
        /// log every message on `updates`
        Sub,
        /// send one request to `ping`
        Req,
        /// answer requests on `ping`
        Rep,
    }

    /// log output format
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LogFormat {
        Standard,
        Json,
        Pretty,
    }

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "nats-demo", bin_name = "nats-demo", about, long_about = None)]
    /// parses from cli & environment var. `.env` in the working dir is loaded as well
    pub struct Config {
        /// role to run
        #[clap(long, env, value_enum, default_value_t = Role::Pub)]
        pub role: Role,
        /// broker url
        #[clap(long, env, value_parser, default_value = DEFAULT_NATS_URL)]
        pub nats: String,
        /// name announced to the broker
        #[clap(long, env, value_parser, default_value = DEFAULT_CONNECTION_NAME)]
        pub connection_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_DEMO_LOG)]
        pub demo_log: String,
        /// log as "standard" (unstructured), "json" or "pretty"
        #[clap(long, env, value_enum, default_value_t = LogFormat::Standard)]
        pub log_format: LogFormat,
        /// Worker thread count, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// messages sent by the pub role
        #[clap(long, env, value_parser, default_value_t = DEFAULT_PUB_COUNT)]
        pub count: usize,
        /// request timeout in milliseconds for the req role
        #[clap(long, env, value_parser, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
        pub request_timeout_ms: u64,
    }

    impl Config {
        /// Create request timeout as `Duration`
        pub fn request_timeout(&self) -> Duration {
            Duration::from_millis(self.request_timeout_ms)
        }

        pub fn connection_options(&self) -> ConnectionOptions {
            ConnectionOptions::default().with_name(&self.connection_name)
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use super::cli::LogFormat;

    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: LogFormat,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(demo_log: &str, log_frmt: LogFormat) -> Result<Self> {
            // Log level comes from DEMO_LOG
            let filter = EnvFilter::try_new(demo_log).or_else(|_| EnvFilter::try_new("info"))?;

            match log_frmt {
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                LogFormat::Pretty => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                LogFormat::Standard => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
