//! The control session server: the switch consults it once per call leg
//! over a line-oriented request/response protocol.

use anyhow::Context;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub mod protocol;
mod session;

pub use session::{serve_session, SessionConfig};

/// How often the idle monitor scans live sessions.
const IDLE_TICK: Duration = Duration::from_secs(30);

/// The router operations a session can dispatch to. The indirection keeps
/// protocol handling testable without a database behind it.
#[async_trait::async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn incoming(
        &self,
        call_id: &str,
        ani: &str,
        dnis: &str,
        inbound: &str,
    ) -> Result<router::LegOneReply, router::Error>;

    async fn returned(
        &self,
        received_ani: &str,
        did: &str,
        provider_on_wire: &str,
        source_ip: &str,
    ) -> Result<router::LegTwoReply, router::Error>;

    async fn finalized(
        &self,
        call_id: &str,
        ani: &str,
        dnis: &str,
        provider_on_wire: &str,
        source_ip: &str,
    ) -> Result<(), router::Error>;

    async fn hangup(&self, call_id: &str) -> Result<(), router::Error>;
}

#[async_trait::async_trait]
impl CallHandler for router::CallRouter {
    async fn incoming(
        &self,
        call_id: &str,
        ani: &str,
        dnis: &str,
        inbound: &str,
    ) -> Result<router::LegOneReply, router::Error> {
        self.process_incoming(call_id, ani, dnis, inbound).await
    }

    async fn returned(
        &self,
        received_ani: &str,
        did: &str,
        provider_on_wire: &str,
        source_ip: &str,
    ) -> Result<router::LegTwoReply, router::Error> {
        self.process_return(received_ani, did, provider_on_wire, source_ip)
            .await
    }

    async fn finalized(
        &self,
        call_id: &str,
        ani: &str,
        dnis: &str,
        provider_on_wire: &str,
        source_ip: &str,
    ) -> Result<(), router::Error> {
        self.process_final(call_id, ani, dnis, provider_on_wire, source_ip)
            .await
    }

    async fn hangup(&self, call_id: &str) -> Result<(), router::Error> {
        self.process_hangup(call_id).await
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 4573,
            max_connections: 1000,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(15),
            buffer_size: 4096,
        }
    }
}

/// Accepts switch connections and serves each on its own task, bounded by
/// `max_connections`. Excess connections are closed immediately.
pub struct Server<H: CallHandler> {
    handler: Arc<H>,
    config: ServerConfig,
}

impl<H: CallHandler> Server<H> {
    pub fn new(handler: Arc<H>, config: ServerConfig) -> Self {
        Self { handler, config }
    }

    pub async fn serve(self, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.listen_address, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind control server on {addr}"))?;
        tracing::info!(addr, "control server listening");

        let limit = Arc::new(tokio::sync::Semaphore::new(self.config.max_connections));
        let sessions: Registry = Arc::new(Mutex::new(HashMap::new()));
        let tracker = tokio_util::task::TaskTracker::new();
        let sessions_token = tokio_util::sync::CancellationToken::new();

        // Idle monitor: closes sessions whose last activity is too old.
        let monitor = tokio::spawn(idle_monitor(
            sessions.clone(),
            self.config.idle_timeout,
            sessions_token.child_token(),
        ));

        let mut next_id: u64 = 0;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(%err, "accept failed");
                            continue;
                        }
                    };

                    let Ok(permit) = limit.clone().try_acquire_owned() else {
                        metrics::counter!("agi_rejected_connections", "reason" => "over_limit")
                            .increment(1);
                        tracing::warn!(%peer, "connection limit reached, rejecting");
                        drop(socket);
                        continue;
                    };
                    socket.set_nodelay(true).ok();

                    next_id += 1;
                    let id = next_id;
                    let activity = Arc::new(Mutex::new(Instant::now()));
                    let cancel = sessions_token.child_token();
                    sessions
                        .lock()
                        .unwrap()
                        .insert(id, (activity.clone(), cancel.clone()));

                    let handler = self.handler.clone();
                    let session_config = SessionConfig {
                        read_timeout: self.config.read_timeout,
                        write_timeout: self.config.write_timeout,
                        buffer_size: self.config.buffer_size,
                    };
                    let sessions = sessions.clone();

                    metrics::gauge!("agi_total_connections").increment(1);
                    tracker.spawn(async move {
                        let result =
                            serve_session(socket, handler, session_config, activity, cancel).await;
                        if let Err(err) = result {
                            tracing::debug!(%peer, %err, "session ended with error");
                        }
                        sessions.lock().unwrap().remove(&id);
                        metrics::gauge!("agi_total_connections").decrement(1);
                        drop(permit);
                    });
                }
                () = shutdown.cancelled() => break,
            }
        }

        // Stop accepting, signal every session, then wait out the drain.
        drop(listener);
        sessions_token.cancel();
        tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = tracker.len(),
                "sessions still open at shutdown deadline, abandoning"
            );
        }
        monitor.abort();
        tracing::info!("control server stopped");
        Ok(())
    }
}

type Registry = Arc<Mutex<HashMap<u64, (Arc<Mutex<Instant>>, tokio_util::sync::CancellationToken)>>>;

async fn idle_monitor(
    sessions: Registry,
    idle_timeout: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(IDLE_TICK) => (),
            () = shutdown.cancelled() => return,
        }

        let now = Instant::now();
        let stale: Vec<tokio_util::sync::CancellationToken> = sessions
            .lock()
            .unwrap()
            .values()
            .filter(|(activity, _)| now.duration_since(*activity.lock().unwrap()) > idle_timeout)
            .map(|(_, token)| token.clone())
            .collect();

        for token in stale {
            metrics::counter!("agi_idle_closed_total").increment(1);
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use router::{Error, LegOneReply, LegTwoReply};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct MockHandler;

    #[async_trait::async_trait]
    impl CallHandler for MockHandler {
        async fn incoming(
            &self,
            call_id: &str,
            ani: &str,
            dnis: &str,
            inbound: &str,
        ) -> Result<LegOneReply, Error> {
            assert_eq!(call_id, "1722470400.42");
            assert_eq!(ani, "+15551000");
            assert_eq!(dnis, "+15552000");
            assert_eq!(inbound, "orig1");
            Ok(LegOneReply {
                did: "1000".to_string(),
                next_hop: "endpoint-tr1".to_string(),
                ani_to_send: "+15552000".to_string(),
                dnis_to_send: "1000".to_string(),
            })
        }

        async fn returned(
            &self,
            received_ani: &str,
            did: &str,
            _provider_on_wire: &str,
            source_ip: &str,
        ) -> Result<LegTwoReply, Error> {
            assert_eq!(received_ani, "+15552000");
            assert_eq!(did, "1000");
            assert_eq!(source_ip, "10.0.0.2:5060");
            Ok(LegTwoReply {
                next_hop: "endpoint-term1".to_string(),
                ani_to_send: "+15551000".to_string(),
                dnis_to_send: "+15552000".to_string(),
            })
        }

        async fn finalized(
            &self,
            _call_id: &str,
            _ani: &str,
            _dnis: &str,
            _provider_on_wire: &str,
            _source_ip: &str,
        ) -> Result<(), Error> {
            Ok(())
        }

        async fn hangup(&self, _call_id: &str) -> Result<(), Error> {
            Err(Error::CallNotFound("gone".to_string()))
        }
    }

    async fn run_session(headers: &str, replies: Vec<&'static str>) -> Vec<String> {
        let (client, server) = tokio::io::duplex(4096);
        let activity = Arc::new(Mutex::new(Instant::now()));
        let cancel = tokio_util::sync::CancellationToken::new();

        let task = tokio::spawn(serve_session(
            server,
            Arc::new(MockHandler),
            SessionConfig::default(),
            activity,
            cancel,
        ));

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(headers.as_bytes()).await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut received = Vec::new();
        let mut replies = replies.into_iter();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            let terminal = line == "200 result=1";
            received.push(line);
            if terminal {
                break;
            }
            // Every non-terminal line is a command expecting one reply.
            let reply = replies.next().unwrap_or("200 result=1");
            write_half
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
        }

        task.await.unwrap().unwrap();
        received
    }

    #[tokio::test]
    async fn incoming_sets_outcome_variables() {
        let headers = "agi_request: agi://router/processIncoming\n\
                       agi_uniqueid: 1722470400.42\n\
                       agi_callerid: +15551000\n\
                       agi_extension: +15552000\n\
                       agi_channel: PJSIP/endpoint-orig1-00000042\n\
                       \n";
        let lines = run_session(headers, vec![]).await;

        assert!(lines.contains(&"SET VARIABLE ROUTER_STATUS \"success\"".to_string()));
        assert!(lines.contains(&"SET VARIABLE DID_ASSIGNED \"1000\"".to_string()));
        assert!(lines.contains(&"SET VARIABLE NEXT_HOP \"endpoint-tr1\"".to_string()));
        assert!(lines.contains(&"SET VARIABLE ANI_TO_SEND \"+15552000\"".to_string()));
        assert!(lines.contains(&"SET VARIABLE DNIS_TO_SEND \"1000\"".to_string()));
        assert!(lines.contains(&"SET VARIABLE INTERMEDIATE_PROVIDER \"tr1\"".to_string()));
        assert_eq!(lines.last().unwrap(), "200 result=1");
    }

    #[tokio::test]
    async fn return_reads_source_address_from_switch() {
        let headers = "agi_request: agi://router/processReturn\n\
                       agi_uniqueid: 1722470401.43\n\
                       agi_callerid: +15552000\n\
                       agi_extension: 1000\n\
                       agi_channel: PJSIP/endpoint-tr1-00000043\n\
                       \n";
        // First command is the GET VARIABLE for the source address.
        let lines = run_session(headers, vec!["200 result=1 (10.0.0.2:5060)"]).await;

        assert_eq!(
            lines[0],
            "GET VARIABLE CHANNEL(pjsip,remote_addr)"
        );
        assert!(lines.contains(&"SET VARIABLE NEXT_HOP \"endpoint-term1\"".to_string()));
        assert!(lines.contains(&"SET VARIABLE FINAL_PROVIDER \"term1\"".to_string()));
        assert!(lines.contains(&"SET VARIABLE ANI_TO_SEND \"+15551000\"".to_string()));
        assert!(lines.contains(&"SET VARIABLE DNIS_TO_SEND \"+15552000\"".to_string()));
    }

    #[tokio::test]
    async fn errors_still_answer_success_with_error_variables() {
        let headers = "agi_request: agi://router/hangup\n\
                       agi_uniqueid: 1722470402.44\n\
                       \n";
        let lines = run_session(headers, vec![]).await;

        assert!(lines.contains(&"SET VARIABLE ROUTER_STATUS \"error\"".to_string()));
        assert!(lines
            .iter()
            .any(|l| l.starts_with("SET VARIABLE ROUTER_ERROR \"unknown call")));
        assert!(lines.contains(&"SET VARIABLE ROUTER_HANGUP_CAUSE \"21\"".to_string()));
        assert_eq!(lines.last().unwrap(), "200 result=1");
    }
}
