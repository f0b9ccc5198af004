//! End-to-end scenarios driving a real `actix-web` test server over a real
//! WebSocket connection, against a minimal fake `guacd` speaking just
//! enough of the handshake to let `SessionHandler` through to
//! `active-master`.
//!
//! These exercise the session engine the way a browser actually would:
//! through `SessionHandler::new` behind a live `actix_web_actors::ws`
//! upgrade, not by poking the actor's private fields.

use std::time::Duration;

use actix_web::web::{self, Data};
use actix_web::{App, Error, HttpRequest, HttpResponse};
use awc::error::WsProtocolError;
use awc::ws::{Frame, Message};
use bytes::BytesMut;
use futures::{Stream, SinkExt, StreamExt};
use slog::{o, Discard, Logger};
use tokio::net::{TcpListener, TcpStream};

use guacg::codec;
use guacg::config::{GuacdConf, SessionConf};
use guacg::parking::ParkingLot;
use guacg::registry::SessionDirectory;
use guacg::session::SessionHandler;

struct TestState {
    directory: Data<SessionDirectory>,
    parking: Data<ParkingLot>,
    guacd: GuacdConf,
    session: SessionConf,
    logger: Logger,
}

async fn test_ws_route(
    req: HttpRequest,
    stream: web::Payload,
    state: Data<TestState>,
) -> Result<HttpResponse, Error> {
    let handler = SessionHandler::new(
        state.directory.clone(),
        state.parking.clone(),
        state.guacd.clone(),
        state.session.clone(),
        state.logger.clone(),
    );
    actix_web_actors::ws::start(handler, &req, stream)
}

/// Accepts one `guacd` handshake per incoming connection and then just
/// drains whatever the master forwards, never replying (there's no
/// browser on the other end of this fake that would care about the
/// echo).
async fn run_fake_guacd(listener: TcpListener) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        tokio::spawn(serve_one_guacd_connection(stream));
    }
}

async fn serve_one_guacd_connection(mut stream: TcpStream) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = BytesMut::with_capacity(4096);
    let mut replies_sent = 0;

    loop {
        let instruction = loop {
            if let Ok(Some(inst)) = codec::parse_one(&mut buf) {
                break inst;
            }
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };

        // Only `select` and `connect` get a reply during the handshake;
        // `mouse` gets a distinguishable ack so tests can observe a
        // pass-through instruction actually reaching guacd; everything
        // else (size/audio/video/image, sync during parking) is drained.
        if instruction.opcode == "select" || instruction.opcode == "connect" {
            let reply = codec::encode("ready", &[]);
            if stream.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
            replies_sent += 1;
        } else if instruction.opcode == "mouse" {
            let reply = codec::encode("mouseok", &[]);
            if stream.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
        let _ = replies_sent;
    }
}

async fn spawn_fake_guacd() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_fake_guacd(listener));
    addr
}

fn test_logger() -> Logger {
    Logger::root(Discard, o!())
}

async fn recv_guacg(
    framed: &mut (impl Stream<Item = Result<Frame, WsProtocolError>> + Unpin),
) -> codec::GuacgInstruction {
    loop {
        match framed.next().await {
            Some(Ok(Frame::Text(bytes))) => {
                let text = std::str::from_utf8(&bytes).unwrap().to_string();
                let mut buf = BytesMut::from(text.as_str());
                if let Ok(Some(inst)) = codec::parse_one(&mut buf) {
                    if inst.is_guacg() {
                        return codec::GuacgInstruction::from_instruction(&inst)
                            .unwrap();
                    }
                }
            }
            Some(Ok(_)) => continue,
            other => panic!("expected a guacg text frame, got {:?}", other),
        }
    }
}

async fn recv_plain(
    framed: &mut (impl Stream<Item = Result<Frame, WsProtocolError>> + Unpin),
) -> codec::GuacamoleInstruction {
    loop {
        match framed.next().await {
            Some(Ok(Frame::Text(bytes))) => {
                let text = std::str::from_utf8(&bytes).unwrap().to_string();
                let mut buf = BytesMut::from(text.as_str());
                if let Ok(Some(inst)) = codec::parse_one(&mut buf) {
                    if !inst.is_guacg() {
                        return inst;
                    }
                }
            }
            Some(Ok(_)) => continue,
            other => panic!("expected a plain text frame, got {:?}", other),
        }
    }
}

fn connect_wire(args: serde_json::Value) -> String {
    codec::GuacgInstruction::new("connect", args).encode()
}

#[actix_rt::test]
async fn new_master_session_reaches_sessionstarted() {
    let guacd_addr = spawn_fake_guacd().await;

    let mut srv = actix_web::test::start(move || {
        let state = Data::new(TestState {
            directory: Data::new(SessionDirectory::new()),
            parking: Data::new(ParkingLot::new()),
            guacd: GuacdConf {
                host: guacd_addr.ip().to_string(),
                port: guacd_addr.port(),
            },
            session: SessionConf::default(),
            logger: test_logger(),
        });
        App::new()
            .app_data(state)
            .route("/ws", web::get().to(test_ws_route))
    });

    let mut framed =
        srv.ws_at("/ws").await.expect("ws upgrade should succeed");

    framed
        .send(Message::Text(
            connect_wire(serde_json::json!({"hostname": "h", "port": 3389})).into(),
        ))
        .await
        .unwrap();

    let inst = recv_guacg(&mut framed).await;
    assert_eq!(inst.opcode, "sessionstarted");
    assert!(inst.json_args.get("sessionId").is_some());
}

#[actix_rt::test]
async fn guest_join_notifies_both_parties() {
    let guacd_addr = spawn_fake_guacd().await;
    let directory = Data::new(SessionDirectory::new());
    let parking = Data::new(ParkingLot::new());

    let directory_for_factory = directory.clone();
    let parking_for_factory = parking.clone();
    let mut srv = actix_web::test::start(move || {
        let state = Data::new(TestState {
            directory: directory_for_factory.clone(),
            parking: parking_for_factory.clone(),
            guacd: GuacdConf {
                host: guacd_addr.ip().to_string(),
                port: guacd_addr.port(),
            },
            session: SessionConf::default(),
            logger: test_logger(),
        });
        App::new()
            .app_data(state)
            .route("/ws", web::get().to(test_ws_route))
    });

    let mut master =
        srv.ws_at("/ws").await.expect("master ws upgrade should succeed");
    master
        .send(Message::Text(
            connect_wire(serde_json::json!({"hostname": "h", "port": 3389})).into(),
        ))
        .await
        .unwrap();
    let started = recv_guacg(&mut master).await;
    let session_id = started.json_args["sessionId"].as_str().unwrap().to_string();

    let mut guest =
        srv.ws_at("/ws").await.expect("guest ws upgrade should succeed");
    guest
        .send(Message::Text(
            connect_wire(serde_json::json!({
                "guest": true,
                "sessionId": session_id,
            }))
            .into(),
        ))
        .await
        .unwrap();

    let guest_started = recv_guacg(&mut guest).await;
    assert_eq!(guest_started.opcode, "sessionstarted");
    assert_eq!(
        guest_started.json_args["sessionId"].as_str().unwrap(),
        session_id
    );
}

#[actix_rt::test]
async fn joining_an_unknown_session_errors_and_closes() {
    let guacd_addr = spawn_fake_guacd().await;

    let mut srv = actix_web::test::start(move || {
        let state = Data::new(TestState {
            directory: Data::new(SessionDirectory::new()),
            parking: Data::new(ParkingLot::new()),
            guacd: GuacdConf {
                host: guacd_addr.ip().to_string(),
                port: guacd_addr.port(),
            },
            session: SessionConf::default(),
            logger: test_logger(),
        });
        App::new()
            .app_data(state)
            .route("/ws", web::get().to(test_ws_route))
    });

    let mut framed =
        srv.ws_at("/ws").await.expect("ws upgrade should succeed");
    framed
        .send(Message::Text(
            connect_wire(serde_json::json!({
                "guest": true,
                "sessionId": "does-not-exist",
            }))
            .into(),
        ))
        .await
        .unwrap();

    let inst = recv_guacg(&mut framed).await;
    assert_eq!(inst.opcode, "notify");
    assert_eq!(inst.json_args["error"], "sessionNotFound");

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match framed.next().await {
                Some(Ok(Frame::Close(_))) | None => break,
                _ => continue,
            }
        }
    })
    .await
    .expect("server should close the socket after a failed join");
}

#[actix_rt::test]
async fn pause_then_resume_reclaims_parked_connection() {
    let guacd_addr = spawn_fake_guacd().await;
    let directory = Data::new(SessionDirectory::new());
    let parking = Data::new(ParkingLot::new());

    let directory_for_factory = directory.clone();
    let parking_for_factory = parking.clone();
    let mut srv = actix_web::test::start(move || {
        let state = Data::new(TestState {
            directory: directory_for_factory.clone(),
            parking: parking_for_factory.clone(),
            guacd: GuacdConf {
                host: guacd_addr.ip().to_string(),
                port: guacd_addr.port(),
            },
            session: SessionConf::default(),
            logger: test_logger(),
        });
        App::new()
            .app_data(state)
            .route("/ws", web::get().to(test_ws_route))
    });

    let mut master =
        srv.ws_at("/ws").await.expect("master ws upgrade should succeed");
    master
        .send(Message::Text(
            connect_wire(serde_json::json!({"hostname": "h", "port": 3389})).into(),
        ))
        .await
        .unwrap();
    let started = recv_guacg(&mut master).await;
    let session_id = started.json_args["sessionId"].as_str().unwrap().to_string();

    master
        .send(Message::Text(
            codec::GuacgInstruction::new("pause", serde_json::json!({})).encode().into(),
        ))
        .await
        .unwrap();

    let paused = recv_guacg(&mut master).await;
    assert_eq!(paused.opcode, "sessionpaused");

    let mut parked = false;
    for _ in 0..50 {
        if parking.contains(&session_id) {
            parked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(parked, "guacd connection should be parked after pause");

    let mut resumed =
        srv.ws_at("/ws").await.expect("resume ws upgrade should succeed");
    resumed
        .send(Message::Text(
            connect_wire(serde_json::json!({
                "resume": true,
                "sessionId": session_id,
            }))
            .into(),
        ))
        .await
        .unwrap();

    let reconnected = recv_guacg(&mut resumed).await;
    assert_eq!(reconnected.opcode, "sessionstarted");
    assert_eq!(
        reconnected.json_args["sessionId"].as_str().unwrap(),
        session_id
    );
    assert!(!parking.contains(&session_id));
}

#[actix_rt::test]
async fn guest_pause_is_ignored_but_master_pause_still_works() {
    let guacd_addr = spawn_fake_guacd().await;

    let mut srv = actix_web::test::start(move || {
        let state = Data::new(TestState {
            directory: Data::new(SessionDirectory::new()),
            parking: Data::new(ParkingLot::new()),
            guacd: GuacdConf {
                host: guacd_addr.ip().to_string(),
                port: guacd_addr.port(),
            },
            session: SessionConf::default(),
            logger: test_logger(),
        });
        App::new()
            .app_data(state)
            .route("/ws", web::get().to(test_ws_route))
    });

    let mut master =
        srv.ws_at("/ws").await.expect("master ws upgrade should succeed");
    master
        .send(Message::Text(
            connect_wire(serde_json::json!({"hostname": "h", "port": 3389})).into(),
        ))
        .await
        .unwrap();
    let started = recv_guacg(&mut master).await;
    let session_id = started.json_args["sessionId"].as_str().unwrap().to_string();

    let mut guest =
        srv.ws_at("/ws").await.expect("guest ws upgrade should succeed");
    guest
        .send(Message::Text(
            connect_wire(serde_json::json!({
                "guest": true,
                "sessionId": session_id,
            }))
            .into(),
        ))
        .await
        .unwrap();
    let _ = recv_guacg(&mut guest).await;

    guest
        .send(Message::Text(
            codec::GuacgInstruction::new("pause", serde_json::json!({})).encode().into(),
        ))
        .await
        .unwrap();

    let no_frame = tokio::time::timeout(Duration::from_millis(200), master.next()).await;
    assert!(
        no_frame.is_err(),
        "a guest-issued pause must not notify the master"
    );

    master
        .send(Message::Text(
            codec::GuacgInstruction::new("pause", serde_json::json!({})).encode().into(),
        ))
        .await
        .unwrap();
    let paused = recv_guacg(&mut master).await;
    assert_eq!(paused.opcode, "sessionpaused");
}

#[actix_rt::test]
async fn guest_control_request_and_master_approve_grants_control() {
    let guacd_addr = spawn_fake_guacd().await;

    let mut srv = actix_web::test::start(move || {
        let state = Data::new(TestState {
            directory: Data::new(SessionDirectory::new()),
            parking: Data::new(ParkingLot::new()),
            guacd: GuacdConf {
                host: guacd_addr.ip().to_string(),
                port: guacd_addr.port(),
            },
            session: SessionConf::default(),
            logger: test_logger(),
        });
        App::new()
            .app_data(state)
            .route("/ws", web::get().to(test_ws_route))
    });

    let mut master =
        srv.ws_at("/ws").await.expect("master ws upgrade should succeed");
    master
        .send(Message::Text(
            connect_wire(serde_json::json!({"hostname": "h", "port": 3389})).into(),
        ))
        .await
        .unwrap();
    let started = recv_guacg(&mut master).await;
    let session_id = started.json_args["sessionId"].as_str().unwrap().to_string();

    let mut guest =
        srv.ws_at("/ws").await.expect("guest ws upgrade should succeed");
    guest
        .send(Message::Text(
            connect_wire(serde_json::json!({
                "guest": true,
                "sessionId": session_id,
            }))
            .into(),
        ))
        .await
        .unwrap();
    let _ = recv_guacg(&mut guest).await;

    // Before approval the guest doesn't control the session: a
    // pass-through instruction it sends never reaches guacd, so no reply
    // comes back.
    guest
        .send(Message::Text(codec::encode("mouse", &["1", "2", "0"]).into()))
        .await
        .unwrap();
    let no_reply =
        tokio::time::timeout(Duration::from_millis(200), recv_plain(&mut guest)).await;
    assert!(
        no_reply.is_err(),
        "guest must not control the session before approval"
    );

    guest
        .send(Message::Text(
            codec::GuacgInstruction::new("control", serde_json::json!({})).encode().into(),
        ))
        .await
        .unwrap();

    // No `guestId` given: the master falls back to its sole pending
    // request.
    master
        .send(Message::Text(
            codec::GuacgInstruction::new("approve", serde_json::json!({})).encode().into(),
        ))
        .await
        .unwrap();

    // `approve` resolves through actor mailboxes (master -> guest);
    // give it a moment to land before exercising the new grant.
    tokio::time::sleep(Duration::from_millis(100)).await;

    guest
        .send(Message::Text(codec::encode("mouse", &["1", "2", "0"]).into()))
        .await
        .unwrap();
    let echoed = recv_plain(&mut guest).await;
    assert_eq!(echoed.opcode, "mouseok");
}
