//! Client behavior against an in-process mock switch speaking the
//! management protocol: banner, login, correlated responses, fan-out
//! events, and completion events.

use ami::{Client, Config, Message};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

async fn mock_switch(banner: &'static str, answer_commands: bool) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_mock(stream, banner, answer_commands));
        }
    });
    addr
}

async fn serve_mock(stream: TcpStream, banner: &'static str, answer_commands: bool) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer
        .write_all(format!("{banner}\r\n").as_bytes())
        .await
        .unwrap();

    loop {
        // Read one message.
        let mut fields: Vec<(String, String)> = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end();
            if line.is_empty() {
                if fields.is_empty() {
                    continue;
                }
                break;
            }
            if let Some((k, v)) = line.split_once(':') {
                fields.push((k.trim().to_string(), v.trim().to_string()));
            }
        }

        let get = |key: &str| {
            fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        let action = get("Action");
        let action_id = get("ActionID");

        let reply = match action.as_str() {
            "Login" => {
                // No ActionID echo on login; also push an unsolicited
                // event right after authenticating.
                "Response: Success\r\nMessage: Authentication accepted\r\n\r\n\
                 Event: FullyBooted\r\nStatus: Fully Booted\r\n\r\n"
                    .to_string()
            }
            "Ping" => format!(
                "Response: Success\r\nActionID: {action_id}\r\nPing: Pong\r\n\r\n"
            ),
            "GetVar" => format!(
                "Response: Success\r\nActionID: {action_id}\r\nVariable: {}\r\nValue: 10.0.0.2:5060\r\n\r\n",
                get("Variable")
            ),
            "Command" if answer_commands => format!(
                "Response: Success\r\nActionID: {action_id}\r\nMessage: Command output follows\r\n\r\n"
            ),
            "Command" => continue, // Swallow: exercises the action timeout.
            "Hangup" => format!(
                "Response: Success\r\nActionID: {action_id}\r\nMessage: Channel Hungup\r\n\r\n"
            ),
            "CoreShowChannels" => format!(
                "Response: Success\r\nActionID: {action_id}\r\nEventList: start\r\n\r\n\
                 Event: CoreShowChannel\r\nActionID: {action_id}\r\nChannel: PJSIP/endpoint-tr1-00000001\r\n\r\n\
                 Event: CoreShowChannel\r\nActionID: {action_id}\r\nChannel: PJSIP/endpoint-term1-00000002\r\n\r\n\
                 Event: CoreShowChannelsComplete\r\nActionID: {action_id}\r\nListItems: 2\r\n\r\n"
            ),
            "Logoff" => format!("Response: Goodbye\r\nActionID: {action_id}\r\n\r\n"),
            _ => format!(
                "Response: Error\r\nActionID: {action_id}\r\nMessage: Invalid/unknown command\r\n\r\n"
            ),
        };
        writer.write_all(reply.as_bytes()).await.unwrap();
    }
}

fn config(addr: std::net::SocketAddr) -> Config {
    Config {
        host: addr.ip().to_string(),
        port: addr.port(),
        username: "router".to_string(),
        password: "secret".to_string(),
        reconnect_interval: Duration::from_millis(100),
        ping_interval: Duration::from_secs(5),
        action_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(1),
        event_buffer_size: 16,
    }
}

#[tokio::test]
async fn connects_pings_and_correlates() {
    let addr = mock_switch("Asterisk Call Manager/5.0.3", true).await;
    let client = Client::new(config(addr));
    client.wait_connected(Duration::from_secs(2)).await.unwrap();

    client.ping().await.expect("ping");

    let value = client
        .get_var("PJSIP/endpoint-tr1-00000001", "CHANNEL(pjsip,remote_addr)")
        .await
        .expect("getvar");
    assert_eq!(value.as_deref(), Some("10.0.0.2:5060"));

    client.reload_endpoints().await.expect("pjsip reload");
    client.hangup("PJSIP/endpoint-tr1-00000001", 21).await.expect("hangup");
}

#[tokio::test]
async fn collects_until_complete_event() {
    let addr = mock_switch("Asterisk Call Manager/5.0.3", true).await;
    let client = Client::new(config(addr));
    client.wait_connected(Duration::from_secs(2)).await.unwrap();

    let channels = client.core_show_channels().await.expect("collect");
    assert_eq!(channels.len(), 2);
    assert_eq!(
        channels[0].get("Channel"),
        Some("PJSIP/endpoint-tr1-00000001")
    );
    assert_eq!(
        channels[1].get("Channel"),
        Some("PJSIP/endpoint-term1-00000002")
    );
}

#[tokio::test]
async fn dispatches_events_to_handlers() {
    let addr = mock_switch("Asterisk Call Manager/5.0.3", true).await;
    let client = Client::new(config(addr));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    client.on_event("FullyBooted", move |event| {
        let _ = tx.send(event);
    });

    client.wait_connected(Duration::from_secs(2)).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event delivered")
        .expect("channel open");
    assert_eq!(event.get("Status"), Some("Fully Booted"));
}

#[tokio::test]
async fn rejects_wrong_banner() {
    let addr = mock_switch("Definitely Not A Call Manager", true).await;
    let client = Client::new(config(addr));

    let connected = client.wait_connected(Duration::from_millis(400)).await;
    assert!(connected.is_err(), "client must not accept a foreign banner");
}

#[tokio::test]
async fn unanswered_actions_time_out() {
    let addr = mock_switch("Asterisk Call Manager/5.0.3", false).await;
    let client = Client::new(config(addr));
    client.wait_connected(Duration::from_secs(2)).await.unwrap();

    let err = client.reload_dialplan().await.expect_err("must time out");
    assert!(matches!(err, ami::Error::Timeout));
}
