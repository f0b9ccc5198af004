//! The `actix-web` `App` factory: the WebSocket upgrade route, and an
//! optional static-file responder for a bundled front-end.

use actix_web::web::Data;
use actix_web::{web, App, Error, HttpRequest, HttpResponse, HttpServer};
use slog::{info, Logger};

use crate::config::Conf;
use crate::parking::ParkingLot;
use crate::registry::SessionDirectory;
use crate::session::SessionHandler;

/// Shared, process-wide state handed to every request.
pub struct AppState {
    pub directory: Data<SessionDirectory>,
    pub parking: Data<ParkingLot>,
    pub conf: Conf,
    pub logger: Logger,
}

async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    state: Data<AppState>,
) -> Result<HttpResponse, Error> {
    let handler = SessionHandler::new(
        state.directory.clone(),
        state.parking.clone(),
        state.conf.guacd.clone(),
        state.conf.session.clone(),
        state.logger.clone(),
    );
    actix_web_actors::ws::start(handler, &req, stream)
}

/// Build and bind the `HttpServer`, ready to `.run()`.
///
/// Returns the server handle alongside the [`ParkingLot`] it was wired
/// with, so `main` can run the idle-eviction sweep against the very
/// instance the handlers share.
///
/// # Errors
///
/// Returns the underlying I/O error if the configured address cannot be
/// bound.
pub fn build(
    conf: Conf,
    logger: Logger,
) -> std::io::Result<(actix_web::dev::Server, Data<ParkingLot>)> {
    let directory = Data::new(SessionDirectory::new());
    let parking = Data::new(ParkingLot::new());
    let endpoint = conf.server.endpoint.clone();
    let bind_addr = format!("{}:{}", conf.server.bind_addr, conf.server.port);
    let serve_static = conf.server.serve_static;

    info!(logger, "starting http server"; "addr" => &bind_addr, "endpoint" => &endpoint);

    let directory_for_factory = directory.clone();
    let parking_for_factory = parking.clone();
    let server = HttpServer::new(move || {
        let state = Data::new(AppState {
            directory: directory_for_factory.clone(),
            parking: parking_for_factory.clone(),
            conf: conf.clone(),
            logger: logger.clone(),
        });

        let mut app = App::new()
            .app_data(state)
            .route(&endpoint, web::get().to(ws_route));

        if serve_static {
            app = app.service(
                actix_files::Files::new("/", "./static").index_file("index.html"),
            );
        }

        app
    })
    .bind(&bind_addr)?
    .run();

    Ok((server, parking))
}
