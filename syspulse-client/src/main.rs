#![forbid(unsafe_code)]

use std::time::Duration;

use argh::FromArgs;
use simple_logger::SimpleLogger;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

mod watch;

#[derive(FromArgs, Debug)]
#[argh(description = "Follow the live telemetry feed of a syspulse server.")]
struct ClientConfig {
    #[argh(
        option,
        short = 'a',
        default = "\"127.0.0.1:3000\".to_string()",
        description = "server address to subscribe to"
    )]
    pub server_addr: String,
    #[argh(
        option,
        default = "1",
        description = "minimum interval between two reconnection attempts in seconds"
    )]
    pub retry_minimum_interval: u64, // in seconds
    #[argh(
        option,
        default = "60",
        description = "maximum interval between two reconnection attempts in seconds"
    )]
    pub retry_maximum_interval: u64, // in seconds
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new().env().init()?;

    let cfg: ClientConfig = argh::from_env();
    log::debug!("Client config: {cfg:#?}");
    anyhow::ensure!(
        cfg.retry_minimum_interval <= cfg.retry_maximum_interval,
        "retry minimum interval must not exceed the maximum"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        }
    });

    let mut reconnect_timer = ReconnectTimer::new(
        Duration::from_secs(cfg.retry_minimum_interval),
        Duration::from_secs(cfg.retry_maximum_interval),
    );

    loop {
        let res: anyhow::Result<()> = async {
            let socket = watch::subscribe(&cfg.server_addr).await?;
            reconnect_timer.reset();

            watch::follow(socket, &shutdown).await?;
            Ok(())
        }
        .await;

        if let Err(e) = res {
            log::warn!("Push channel lost: {e}");
            log::info!(
                "Reconnecting in {} seconds...",
                reconnect_timer.interval().as_secs()
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = reconnect_timer.wait() => {}
            }
        } else {
            return Ok(()); // means graceful shutdown
        }
    }
}

/// Exponential backoff between reconnection attempts.
struct ReconnectTimer {
    minimal_interval: Duration,
    maximal_interval: Duration,
    curr_interval: Duration,
}

impl ReconnectTimer {
    fn new(minimal_interval: Duration, maximal_interval: Duration) -> Self {
        debug_assert!(minimal_interval <= maximal_interval);

        Self {
            minimal_interval,
            maximal_interval,
            curr_interval: minimal_interval,
        }
    }

    async fn wait(&mut self) {
        sleep(self.curr_interval).await;
        self.bump();
    }

    fn bump(&mut self) {
        self.curr_interval = (self.curr_interval * 2).min(self.maximal_interval);
    }

    fn reset(&mut self) {
        self.curr_interval = self.minimal_interval;
    }

    fn interval(&self) -> Duration {
        self.curr_interval
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_maximum() {
        let mut timer = ReconnectTimer::new(Duration::from_secs(1), Duration::from_secs(5));
        let mut seen = vec![timer.interval().as_secs()];
        for _ in 0..4 {
            timer.bump();
            seen.push(timer.interval().as_secs());
        }
        assert_eq!(seen, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_reset_returns_to_minimum() {
        let mut timer = ReconnectTimer::new(Duration::from_secs(1), Duration::from_secs(60));
        timer.bump();
        timer.bump();
        assert_eq!(timer.interval(), Duration::from_secs(4));

        timer.reset();
        assert_eq!(timer.interval(), Duration::from_secs(1));
    }
}
