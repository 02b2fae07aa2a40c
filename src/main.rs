use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use proxy_pool::{
    CheckerConfig, ClientConfig, FetcherConfig, HealthChecker, HealthCheckerHandle, PoolConfig,
    PoolStats, ProxyFetcher, ProxyPool, ProxyProtocol, ResilientClient,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Self-healing proxy pool with a resilient HTTP client
#[derive(Parser)]
#[command(name = "proxy-pool")]
#[command(about = "Self-healing proxy pool with a resilient HTTP client")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Pool snapshot file
    #[arg(short, long, env = "PROXY_POOL_FILE", default_value = "proxy_pool.json")]
    file: PathBuf,

    /// Maximum number of proxies kept in the pool
    #[arg(long, env = "PROXY_POOL_MAX_SIZE", default_value = "100")]
    max_pool_size: usize,

    /// Failures before a proxy is excluded from selection
    #[arg(long, env = "PROXY_POOL_MAX_RETRIES", default_value = "3")]
    max_retries: u32,

    /// Health probe timeout in seconds
    #[arg(long, env = "PROXY_POOL_TIMEOUT", default_value = "10")]
    timeout: u64,

    /// Number of concurrent health probes
    #[arg(short = 'n', long, env = "PROXY_POOL_CONCURRENCY", default_value = "10")]
    concurrency: usize,

    /// Seconds between scheduled health checks
    #[arg(long, env = "PROXY_POOL_CHECK_INTERVAL", default_value = "300")]
    check_interval: u64,

    /// MMDB file used to fill in proxy countries
    #[arg(long, env = "PROXY_POOL_MMDB")]
    mmdb: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the pool summary
    Status,
    /// Fetch from every source, merge and health-check
    Refresh,
    /// Health-check the first N proxies
    Test {
        #[arg(default_value = "10")]
        count: usize,
    },
    /// Reset the failed set
    Clear,
    /// Add a proxy and test it immediately
    Add {
        /// Proxy address as ip:port
        address: String,
        /// Proxy protocol (http, https, socks4, socks5)
        #[arg(default_value = "http")]
        protocol: String,
    },
    /// Remove a proxy
    Remove {
        /// Proxy address as ip:port
        address: String,
    },
    /// List the best scored proxies
    Top {
        #[arg(default_value = "10")]
        limit: usize,
    },
    /// Fetch a URL through the resilient client
    Get {
        url: String,
        /// Skip the pool and go direct
        #[arg(long)]
        direct: bool,
    },
    /// Run scheduled health checks until Ctrl+C
    Watch,
}

impl Cli {
    fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .with_proxy_file(self.file.clone())
            .with_max_pool_size(self.max_pool_size)
            .with_max_retries(self.max_retries)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_concurrent_checks(self.concurrency)
            .with_check_interval(Duration::from_secs(self.check_interval))
    }

    fn checker_config(&self, pool_config: &PoolConfig) -> CheckerConfig {
        let config = CheckerConfig::from_pool_config(pool_config);
        match &self.mmdb {
            Some(path) => config.with_mmdb_path(path.clone()),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxy_pool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.pool_config();
    let checker = HealthChecker::with_config(cli.checker_config(&config));
    let fetcher = ProxyFetcher::with_config(FetcherConfig::default())?;
    let pool = Arc::new(ProxyPool::with_components(config, fetcher, checker));
    pool.load().await;

    match cli.command {
        Some(Commands::Status) | None => print_stats(&pool.get_stats()),
        Some(Commands::Refresh) => {
            let report = pool.force_refresh().await;
            println!(
                "Refresh complete: {} checked, {} working, {} failed, {} removed",
                report.checked, report.working, report.failed, report.removed
            );
            print_stats(&pool.get_stats());
        }
        Some(Commands::Test { count }) => {
            println!("Testing the first {} proxies...", count);
            let report = pool.checker().probe_first(&pool, count).await;
            println!(
                "Results: {} working, {} failed",
                report.working, report.failed
            );
        }
        Some(Commands::Clear) => {
            let cleared = pool.reset_failed();
            pool.save()?;
            println!("Cleared {} failed proxies", cleared);
        }
        Some(Commands::Add { address, protocol }) => {
            let protocol: ProxyProtocol = protocol.parse()?;
            if !pool.add_custom_proxy(&address, protocol)? {
                println!("Proxy {} already exists", address);
                return Ok(());
            }
            println!("Added proxy {}, testing...", address);
            let record = pool
                .get(address.trim())
                .ok_or_else(|| anyhow!("Proxy {} vanished after insert", address))?;
            let working = pool.checker().test_one(&pool, &record).await;
            pool.save()?;
            println!("Proxy {} is {}", address, if working { "working" } else { "not working" });
        }
        Some(Commands::Remove { address }) => {
            if pool.remove_proxy(&address) {
                println!("Removed proxy {}", address);
            } else {
                eprintln!("Proxy not found: {}", address);
            }
        }
        Some(Commands::Top { limit }) => {
            let top = pool.get_top_proxies(limit);
            if top.is_empty() {
                println!("No proxies in the pool.");
            }
            for (rank, record) in top.iter().enumerate() {
                println!(
                    "{:>3}. {:<24} {:<7} score {:>5.1}  success {:>5.1}%  {:>5.2}s  {}",
                    rank + 1,
                    record.address,
                    record.protocol,
                    record.quality_score,
                    record.success_rate() * 100.0,
                    record.response_time,
                    record.country
                );
            }
        }
        Some(Commands::Get { url, direct }) => {
            let client = ResilientClient::with_config(
                pool.clone(),
                ClientConfig::new().with_use_proxy(!direct),
            );
            let response = client.get(&url).await?;
            let status = response.status();
            let body = response.text().await?;
            println!("HTTP {}", status);
            println!("{}", body);
            pool.save()?;
        }
        Some(Commands::Watch) => {
            let (handle, shutdown) = HealthCheckerHandle::new();
            let watcher = pool.checker().clone();
            let watched = pool.clone();
            let task = tokio::spawn(async move { watcher.run(watched, shutdown).await });

            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C, stopping health checks");
            handle.shutdown();
            task.await?;
            pool.shutdown()?;
        }
    }

    Ok(())
}

fn print_stats(stats: &PoolStats) {
    println!("Proxy pool status");
    println!("  Total proxies:      {}", stats.total_proxies);
    println!("  Working proxies:    {}", stats.working_proxies);
    println!("  Failed proxies:     {}", stats.failed_proxies);
    println!("  High quality:       {}", stats.high_quality_proxies);
    println!("  Working ratio:      {:.1}%", stats.working_ratio);
    println!("  Avg response time:  {:.2}s", stats.avg_response_time);
    println!("  Avg score:          {:.1}", stats.avg_score);
    println!("  Pool quality:       {}", stats.pool_quality);
    match stats.last_health_check {
        Some(at) => println!("  Last health check:  {}", at),
        None => println!("  Last health check:  never"),
    }
    println!(
        "  Direct requests:    {} ({} ok)",
        stats.direct.total_requests, stats.direct.successful_requests
    );

    for (title, distribution) in [
        ("Protocols", &stats.protocol_distribution),
        ("Sources", &stats.source_distribution),
        ("Countries", &stats.country_distribution),
    ] {
        if distribution.is_empty() {
            continue;
        }
        println!("{}:", title);
        for (name, count) in distribution {
            println!("  {:<20} {}", name, count);
        }
    }
}
