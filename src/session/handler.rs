//! The per-WebSocket session state machine.
//!
//! One [`SessionHandler`] actor is created per accepted browser
//! WebSocket. It starts `unbound`, resolves into `active-master` or
//! `active-guest` on its first `connect`, and from there mediates
//! between the browser socket (`ws::WebsocketContext`) and the upstream
//! `guacd` connection (owned only by masters; guests relay through their
//! master's address).

use actix::{
    Actor, ActorContext, ActorFutureExt, Addr, AsyncContext, Handler,
    Running, StreamHandler, WrapFuture,
};
use actix_web::web::Data;
use actix_web_actors::ws;
use serde_json::{json, Value};
use slog::{error, info, o, warn, Logger};

use crate::codec::{self, GuacgInstruction};
use crate::config::{GuacdConf, SessionConf};
use crate::guacd::{ConnectArgs, ConnectMode, GuacdConnection, GuacdWriter};
use crate::parking::ParkingLot;
use crate::reader::ReaderHandle;
use crate::registry::SessionDirectory;

use super::messages::{
    AttachGuest, CloseSession, DeliverUpstream, DetachGuest, ForwardUpstream,
    RequestControl, SetControlling, UpstreamClosed,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unbound,
    Master,
    Guest,
}

struct GuestRef {
    session_id: String,
    addr: Addr<SessionHandler>,
}

/// The actor bound to one browser WebSocket's lifetime.
pub struct SessionHandler {
    session_id: String,
    role: Role,
    controlling: bool,
    master_session_id: Option<String>,
    master_addr: Option<Addr<SessionHandler>>,
    guests: Vec<GuestRef>,
    /// Guest session IDs with an outstanding `control` request, oldest
    /// first. A repeat request from a guest already in this list doesn't
    /// add a second entry.
    pending_control: Vec<String>,
    /// `None` means the master itself controls; `Some(id)` names the
    /// guest currently holding control.
    current_controller: Option<String>,
    paused: bool,
    upstream: Option<Box<dyn GuacdWriter>>,
    reader: Option<ReaderHandle>,
    directory: Data<SessionDirectory>,
    parking: Data<ParkingLot>,
    guacd_conf: GuacdConf,
    session_conf: SessionConf,
    logger: Logger,
}

impl SessionHandler {
    #[must_use]
    pub fn new(
        directory: Data<SessionDirectory>,
        parking: Data<ParkingLot>,
        guacd_conf: GuacdConf,
        session_conf: SessionConf,
        logger: Logger,
    ) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let logger = logger.new(o!("session_id" => session_id.clone()));
        Self {
            session_id,
            role: Role::Unbound,
            controlling: false,
            master_session_id: None,
            master_addr: None,
            guests: Vec::new(),
            pending_control: Vec::new(),
            current_controller: None,
            paused: false,
            upstream: None,
            reader: None,
            directory,
            parking,
            guacd_conf,
            session_conf,
            logger,
        }
    }

    fn notify_self(&self, ctx: &mut ws::WebsocketContext<Self>, event: &str, args: Value) {
        ctx.text(GuacgInstruction::new(event, args).encode());
    }

    /// Write a notification to this handler's own socket and, if it is a
    /// master, fan it out to every attached guest.
    fn notify_peers(&self, ctx: &mut ws::WebsocketContext<Self>, event: &str, args: Value) {
        let wire = GuacgInstruction::new(event, args).encode();
        ctx.text(wire.clone());
        for guest in &self.guests {
            guest.addr.do_send(DeliverUpstream(wire.clone()));
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let mut buf = bytes::BytesMut::from(text);
        loop {
            match codec::parse_one(&mut buf) {
                Ok(Some(instruction)) => self.handle_instruction(instruction, ctx),
                Ok(None) => break,
                Err(e) => {
                    warn!(self.logger, "malformed instruction"; "error" => %e);
                    break;
                }
            }
        }
    }

    fn handle_instruction(
        &mut self,
        instruction: codec::GuacamoleInstruction,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if instruction.is_guacg() {
            match GuacgInstruction::from_instruction(&instruction) {
                Ok(inst) => self.handle_guacg(inst, ctx),
                Err(e) => {
                    self.notify_self(ctx, "notify", json!({ "error": e.to_string() }));
                }
            }
            return;
        }

        if self.paused {
            return;
        }

        if self.controlling {
            let wire = instruction.encode();
            self.forward_upstream(wire, ctx);
        }
    }

    fn handle_guacg(&mut self, inst: GuacgInstruction, ctx: &mut ws::WebsocketContext<Self>) {
        if inst.opcode == "connect" {
            self.handle_connect(inst.json_args, ctx);
            return;
        }

        if self.paused {
            return;
        }

        match inst.opcode.as_str() {
            "pause" => self.handle_pause(ctx),
            "control" => self.handle_control_request(),
            "approve" => self.handle_approve(inst.json_args),
            "reject" => self.handle_reject(inst.json_args),
            "remove" => self.handle_remove(inst.json_args),
            _ => {}
        }
    }

    fn handle_connect(&mut self, payload: Value, ctx: &mut ws::WebsocketContext<Self>) {
        if self.role != Role::Unbound {
            self.notify_self(ctx, "notify", json!({ "error": "alreadyConnected" }));
            return;
        }

        let args = match ConnectArgs::from_json(&payload, &self.session_conf) {
            Ok(args) => args,
            Err(e) => {
                self.notify_self(ctx, "notify", json!({ "error": e.to_string() }));
                return;
            }
        };

        match args.mode() {
            Ok(ConnectMode::NewMaster) => self.start_new_master(args, ctx),
            Ok(ConnectMode::Guest { session_id }) => self.join_as_guest(session_id, ctx),
            Ok(ConnectMode::Resume { session_id }) => self.start_resume(session_id, args, ctx),
            Err(_) => {
                self.notify_self(ctx, "notify", json!({ "error": "invalidConnectArgs" }));
                ctx.close(None);
                ctx.stop();
            }
        }
    }

    fn join_as_guest(&mut self, session_id: String, ctx: &mut ws::WebsocketContext<Self>) {
        if session_id == self.session_id {
            self.notify_self(ctx, "notify", json!({ "error": "cannotJoinSelf" }));
            return;
        }

        match self.directory.lookup(&session_id) {
            Ok(master_addr) => {
                self.role = Role::Guest;
                self.master_session_id = Some(session_id.clone());
                self.master_addr = Some(master_addr.clone());
                self.controlling = false;
                master_addr.do_send(AttachGuest {
                    session_id: self.session_id.clone(),
                    addr: ctx.address(),
                });
                self.notify_self(ctx, "sessionstarted", json!({ "sessionId": session_id }));
            }
            Err(e) => {
                warn!(self.logger, "guest join failed"; "error" => %e);
                self.notify_self(ctx, "notify", json!({ "error": "sessionNotFound" }));
                ctx.close(None);
                ctx.stop();
            }
        }
    }

    fn start_new_master(&mut self, args: ConnectArgs, ctx: &mut ws::WebsocketContext<Self>) {
        let conf = self.guacd_conf.clone();
        let logger = self.logger.clone();
        let fut = async move { GuacdConnection::establish(&conf, &args).await };

        ctx.spawn(fut.into_actor(self).map(move |result, act, ctx| {
            match result {
                Ok(conn) => act.on_master_connected(conn, ctx),
                Err(e) => {
                    error!(logger, "guacd handshake failed"; "error" => %e);
                    act.notify_self(ctx, "notify", json!({ "error": "handshakeFailed" }));
                    ctx.close(None);
                    ctx.stop();
                }
            }
        }));
    }

    fn on_master_connected(&mut self, conn: GuacdConnection, ctx: &mut ws::WebsocketContext<Self>) {
        let (writer, reader) = conn.split();
        self.upstream = Some(writer);
        self.role = Role::Master;
        self.controlling = true;
        self.directory.register(self.session_id.clone(), ctx.address());
        self.reader = Some(ReaderHandle::spawn(reader, ctx.address()));
        self.notify_self(ctx, "sessionstarted", json!({ "sessionId": self.session_id }));
    }

    fn start_resume(
        &mut self,
        session_id: String,
        args: ConnectArgs,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let parking = self.parking.clone();
        let fut = async move {
            let conn = parking.unpark(&session_id).await;
            (session_id, conn)
        };

        ctx.spawn(fut.into_actor(self).map(move |(session_id, conn), act, ctx| {
            match conn {
                Ok(conn) => act.on_resumed(session_id, args, conn, ctx),
                Err(e) => {
                    warn!(act.logger, "resume failed"; "error" => %e);
                    act.notify_self(ctx, "notify", json!({ "error": "sessionNotFound" }));
                    ctx.close(None);
                    ctx.stop();
                }
            }
        }));
    }

    fn on_resumed(
        &mut self,
        session_id: String,
        args: ConnectArgs,
        conn: GuacdConnection,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        self.session_id = session_id.clone();
        self.role = Role::Master;
        self.controlling = true;
        self.paused = false;

        let (mut writer, reader) = conn.split();
        let width = args.width.to_string();
        let height = args.height.to_string();
        let dpi = args.dpi.to_string();
        let size_wire = codec::encode(
            "size",
            &[width.as_str(), height.as_str(), dpi.as_str()],
        );
        ctx.text(size_wire.clone());

        let fut = async move {
            let _ = writer.send(&size_wire).await;
            writer
        };
        ctx.spawn(fut.into_actor(self).map(move |writer, act, _ctx| {
            act.upstream = Some(writer);
        }));

        self.directory.register(self.session_id.clone(), ctx.address());
        self.reader = Some(ReaderHandle::spawn(reader, ctx.address()));
        self.notify_self(ctx, "sessionstarted", json!({ "sessionId": session_id }));
    }

    fn forward_upstream(&mut self, wire: String, ctx: &mut ws::WebsocketContext<Self>) {
        match self.role {
            Role::Master => {
                if let Some(mut writer) = self.upstream.take() {
                    let logger = self.logger.clone();
                    let fut = async move {
                        let result = writer.send(&wire).await;
                        (writer, result)
                    };
                    ctx.spawn(fut.into_actor(self).map(move |(writer, result), act, _ctx| {
                        act.upstream = Some(writer);
                        if let Err(e) = result {
                            error!(logger, "failed writing to guacd"; "error" => %e);
                        }
                    }));
                }
            }
            Role::Guest => {
                if let Some(master) = &self.master_addr {
                    master.do_send(ForwardUpstream(wire));
                }
            }
            Role::Unbound => {}
        }
    }

    fn handle_pause(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.role != Role::Master {
            return;
        }
        self.paused = true;
        self.notify_peers(ctx, "sessionpaused", json!({}));

        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => return,
        };
        let writer = self.upstream.take();
        let parking = self.parking.clone();
        let session_id = self.session_id.clone();
        let logger = self.logger.clone();

        let fut = async move {
            let reader = reader.stop().await;
            (writer, reader)
        };
        ctx.spawn(fut.into_actor(self).map(move |(writer, reader), _act, _ctx| {
            if let Some(writer) = writer {
                let conn = GuacdConnection::from_halves(writer, reader);
                if let Err(e) = parking.park(session_id, conn) {
                    warn!(logger, "failed to park session"; "error" => %e);
                }
            }
        }));
    }

    fn handle_control_request(&mut self) {
        if self.role == Role::Guest {
            if let Some(master) = &self.master_addr {
                master.do_send(RequestControl(self.session_id.clone()));
            }
        }
    }

    fn handle_approve(&mut self, args: Value) {
        if self.role != Role::Master {
            return;
        }
        let guest_id = args
            .get("guestId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.pending_control.first().cloned());
        let guest_id = match guest_id {
            Some(id) => id,
            None => return,
        };
        let guest_addr = match self.guests.iter().find(|g| g.session_id == guest_id) {
            Some(g) => g.addr.clone(),
            None => return,
        };

        match self.current_controller.take() {
            Some(prev_id) if prev_id != guest_id => {
                if let Some(prev) = self.guests.iter().find(|g| g.session_id == prev_id) {
                    prev.addr.do_send(SetControlling(false));
                }
            }
            Some(prev_id) => {
                self.current_controller = Some(prev_id);
                return;
            }
            None => {
                self.controlling = false;
            }
        }

        guest_addr.do_send(SetControlling(true));
        self.current_controller = Some(guest_id.clone());
        self.pending_control.retain(|id| *id != guest_id);
    }

    fn handle_reject(&mut self, args: Value) {
        if self.role != Role::Master {
            return;
        }
        let guest_id = args
            .get("guestId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.pending_control.first().cloned());
        if let Some(guest_id) = guest_id {
            self.pending_control.retain(|id| *id != guest_id);
        }
    }

    fn handle_remove(&mut self, args: Value) {
        if self.role != Role::Master {
            return;
        }
        let guest_id = match args.get("guestId").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => return,
        };

        if let Some(pos) = self.guests.iter().position(|g| g.session_id == guest_id) {
            let guest = self.guests.remove(pos);
            guest.addr.do_send(CloseSession {
                notify_event: Some(("sessionended".to_string(), json!({ "reason": "removed" }))),
                reason: Some("removed by master".into()),
            });
            if self.current_controller.as_deref() == Some(guest_id.as_str()) {
                self.current_controller = None;
                self.controlling = true;
            }
            self.pending_control.retain(|id| *id != guest_id);
        }
    }
}

impl Actor for SessionHandler {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!(self.logger, "websocket connection opened");
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        match self.role {
            Role::Guest => {
                if let Some(master) = &self.master_addr {
                    master.do_send(DetachGuest(self.session_id.clone()));
                }
            }
            Role::Master => {
                self.directory.unregister(&self.session_id);
                if let Some(reader) = self.reader.take() {
                    tokio::spawn(async move {
                        let _ = reader.stop().await;
                    });
                }
                self.upstream.take();
            }
            Role::Unbound => {}
        }
        Running::Stop
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionHandler {
    fn handle(
        &mut self,
        msg: Result<ws::Message, ws::ProtocolError>,
        ctx: &mut Self::Context,
    ) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(self.logger, "websocket protocol error"; "error" => %e);
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Text(text) => self.handle_text(text.as_ref(), ctx),
            ws::Message::Binary(bin) => {
                if let Ok(text) = std::str::from_utf8(&bin) {
                    self.handle_text(text, ctx);
                }
            }
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) | ws::Message::Nop => {}
        }
    }
}

impl Handler<AttachGuest> for SessionHandler {
    type Result = ();

    fn handle(&mut self, msg: AttachGuest, _ctx: &mut Self::Context) -> Self::Result {
        if self.guests.iter().any(|g| g.session_id == msg.session_id) {
            return;
        }
        self.guests.push(GuestRef {
            session_id: msg.session_id,
            addr: msg.addr,
        });
    }
}

impl Handler<DetachGuest> for SessionHandler {
    type Result = ();

    fn handle(&mut self, msg: DetachGuest, _ctx: &mut Self::Context) -> Self::Result {
        self.guests.retain(|g| g.session_id != msg.0);
        if self.current_controller.as_deref() == Some(msg.0.as_str()) {
            self.current_controller = None;
            self.controlling = true;
        }
        self.pending_control.retain(|id| *id != msg.0);
    }
}

impl Handler<DeliverUpstream> for SessionHandler {
    type Result = ();

    fn handle(&mut self, msg: DeliverUpstream, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0.clone());

        let mut dead = Vec::new();
        for (i, guest) in self.guests.iter().enumerate() {
            if guest.addr.try_send(DeliverUpstream(msg.0.clone())).is_err() {
                dead.push(i);
            }
        }
        for i in dead.into_iter().rev() {
            self.guests.remove(i);
        }
    }
}

impl Handler<UpstreamClosed> for SessionHandler {
    type Result = ();

    fn handle(&mut self, _msg: UpstreamClosed, ctx: &mut Self::Context) -> Self::Result {
        self.notify_peers(ctx, "sessionended", json!({ "reason": "upstreamClosed" }));
        for guest in self.guests.drain(..) {
            guest.addr.do_send(CloseSession {
                notify_event: None,
                reason: Some("upstream closed".into()),
            });
        }
        ctx.close(None);
        ctx.stop();
    }
}

impl Handler<RequestControl> for SessionHandler {
    type Result = ();

    fn handle(&mut self, msg: RequestControl, _ctx: &mut Self::Context) -> Self::Result {
        if self.role == Role::Master && !self.pending_control.contains(&msg.0) {
            self.pending_control.push(msg.0);
        }
    }
}

impl Handler<SetControlling> for SessionHandler {
    type Result = ();

    fn handle(&mut self, msg: SetControlling, _ctx: &mut Self::Context) -> Self::Result {
        self.controlling = msg.0;
    }
}

impl Handler<ForwardUpstream> for SessionHandler {
    type Result = ();

    fn handle(&mut self, msg: ForwardUpstream, ctx: &mut Self::Context) -> Self::Result {
        if self.role == Role::Master {
            self.forward_upstream(msg.0, ctx);
        }
    }
}

impl Handler<CloseSession> for SessionHandler {
    type Result = ();

    fn handle(&mut self, msg: CloseSession, ctx: &mut Self::Context) -> Self::Result {
        if let Some((event, args)) = msg.notify_event {
            self.notify_self(ctx, &event, args);
        }
        ctx.close(msg.reason.map(|description| ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some(description),
        }));
        ctx.stop();
    }
}
