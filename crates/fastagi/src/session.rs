use crate::protocol::{get_variable, set_variable, AgiRequest, CommandStatus};
use crate::CallHandler;
use anyhow::Context;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            buffer_size: 4096,
        }
    }
}

/// Serves one switch connection: reads the header block, dispatches, sets
/// the outcome variables, and finishes with the terminal status line. The
/// switch is always answered `200 result=1` so its dialplan stays on the
/// success path; failures travel in `ROUTER_STATUS`/`ROUTER_ERROR`.
pub async fn serve_session<S, H>(
    stream: S,
    handler: Arc<H>,
    config: SessionConfig,
    activity: Arc<Mutex<Instant>>,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: CallHandler,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut session = Session {
        reader: BufReader::with_capacity(config.buffer_size, read_half),
        writer: write_half,
        config,
        activity,
        cancel,
    };

    let request = session.read_request().await?;
    session.dispatch(&request, handler).await?;

    session.write_line("200 result=1\n").await?;
    session.writer.shutdown().await.ok();
    Ok(())
}

struct Session<S: AsyncRead + AsyncWrite> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
    config: SessionConfig,
    activity: Arc<Mutex<Instant>>,
    cancel: tokio_util::sync::CancellationToken,
}

impl<S: AsyncRead + AsyncWrite> Session<S> {
    fn touch(&self) {
        *self.activity.lock().unwrap() = Instant::now();
    }

    async fn read_line(&mut self) -> anyhow::Result<String> {
        let mut line = String::new();
        let read = tokio::select! {
            read = tokio::time::timeout(self.config.read_timeout, self.reader.read_line(&mut line)) => {
                read.context("read deadline exceeded")?
            }
            () = self.cancel.cancelled() => anyhow::bail!("session cancelled"),
        };
        if read? == 0 {
            anyhow::bail!("connection closed by switch");
        }
        self.touch();
        Ok(line.trim_end().to_string())
    }

    async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        tokio::time::timeout(
            self.config.write_timeout,
            self.writer.write_all(line.as_bytes()),
        )
        .await
        .context("write deadline exceeded")??;
        self.touch();
        Ok(())
    }

    async fn read_request(&mut self) -> anyhow::Result<AgiRequest> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        Ok(AgiRequest::parse(&lines))
    }

    /// Sends one command and parses the switch's single-line reply.
    async fn command(&mut self, command: &str) -> anyhow::Result<CommandStatus> {
        self.write_line(command).await?;
        let reply = self.read_line().await?;
        Ok(CommandStatus::parse(&reply))
    }

    async fn set_var(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        match self.command(&set_variable(name, value)).await? {
            CommandStatus::Success(_) => Ok(()),
            status => {
                tracing::debug!(name, ?status, "switch rejected SET VARIABLE");
                Ok(())
            }
        }
    }

    async fn get_var(&mut self, name: &str) -> anyhow::Result<Option<String>> {
        match self.command(&get_variable(name)).await? {
            CommandStatus::Success(value) => Ok(value),
            _ => Ok(None),
        }
    }

    async fn dispatch<H: CallHandler>(
        &mut self,
        request: &AgiRequest,
        handler: Arc<H>,
    ) -> anyhow::Result<()> {
        let script = request.request().to_string();
        let provider = router::provider_from_channel(request.channel());

        let (op, outcome) = if script.contains("processIncoming") {
            let result = handler
                .incoming(request.call_id(), request.ani(), request.dnis(), &provider)
                .await;
            match result {
                Ok(reply) => {
                    self.set_var("ROUTER_STATUS", "success").await?;
                    self.set_var("DID_ASSIGNED", &reply.did).await?;
                    self.set_var("NEXT_HOP", &reply.next_hop).await?;
                    self.set_var("ANI_TO_SEND", &reply.ani_to_send).await?;
                    self.set_var("DNIS_TO_SEND", &reply.dnis_to_send).await?;
                    self.set_var("INTERMEDIATE_PROVIDER", strip_endpoint(&reply.next_hop))
                        .await?;
                    ("incoming", Ok(()))
                }
                Err(err) => ("incoming", Err(err)),
            }
        } else if script.contains("processReturn") {
            let source_ip = self.source_address().await?;
            let result = handler
                .returned(request.ani(), request.dnis(), &provider, &source_ip)
                .await;
            match result {
                Ok(reply) => {
                    self.set_var("ROUTER_STATUS", "success").await?;
                    self.set_var("NEXT_HOP", &reply.next_hop).await?;
                    self.set_var("ANI_TO_SEND", &reply.ani_to_send).await?;
                    self.set_var("DNIS_TO_SEND", &reply.dnis_to_send).await?;
                    self.set_var("FINAL_PROVIDER", strip_endpoint(&reply.next_hop))
                        .await?;
                    ("return", Ok(()))
                }
                Err(err) => ("return", Err(err)),
            }
        } else if script.contains("processFinal") {
            let source_ip = self.source_address().await?;
            let result = handler
                .finalized(
                    request.call_id(),
                    request.ani(),
                    request.dnis(),
                    &provider,
                    &source_ip,
                )
                .await;
            match result {
                Ok(()) => {
                    self.set_var("ROUTER_STATUS", "success").await?;
                    ("final", Ok(()))
                }
                Err(err) => ("final", Err(err)),
            }
        } else if script.contains("hangup") {
            match handler.hangup(request.call_id()).await {
                Ok(()) => {
                    self.set_var("ROUTER_STATUS", "success").await?;
                    ("hangup", Ok(()))
                }
                Err(err) => ("hangup", Err(err)),
            }
        } else {
            (
                "unknown",
                Err(router::Error::InvalidCommand(script.clone())),
            )
        };

        metrics::counter!("router_requests_total", "op" => op).increment(1);

        if let Err(err) = outcome {
            metrics::counter!(
                "router_requests_failed",
                "op" => op,
                "kind" => err.kind_str()
            )
            .increment(1);
            tracing::warn!(op, call_id = request.call_id(), %err, "request failed");

            self.set_var("ROUTER_STATUS", "error").await?;
            self.set_var("ROUTER_ERROR", &err.to_string()).await?;
            self.set_var("ROUTER_HANGUP_CAUSE", &err.hangup_cause().to_string())
                .await?;
        }
        Ok(())
    }

    /// The signaling source address of the inbound channel, fetched from
    /// the switch over this same connection.
    async fn source_address(&mut self) -> anyhow::Result<String> {
        Ok(self
            .get_var("CHANNEL(pjsip,remote_addr)")
            .await?
            .unwrap_or_default())
    }
}

fn strip_endpoint(next_hop: &str) -> &str {
    next_hop.strip_prefix("endpoint-").unwrap_or(next_hop)
}

#[cfg(test)]
mod tests {
    use super::strip_endpoint;

    #[test]
    fn strips_endpoint_prefix() {
        assert_eq!(strip_endpoint("endpoint-tr1"), "tr1");
        assert_eq!(strip_endpoint("tr1"), "tr1");
    }
}
