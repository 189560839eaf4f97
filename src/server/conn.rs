use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::WriteHalf;
use tokio::sync::{mpsc, oneshot};
use util::sync::Mutex;

use super::session::{HandleAction, SessionJob, SessionShared};
use super::{DescribeContext, ServerInner};
use crate::conn::{BoxStream, MessageReader, MessageWriter};
use crate::error::{Error, Result};
use crate::message::{Message, Method, Request, Response, StatusCode};

pub(crate) type ChannelReadFn = Box<dyn FnMut(&[u8]) + Send>;

/// Connection state shared with sessions: the serialized writer, the
/// channel dispatch table of the interleaved session, and the flag allowing
/// interleaved frames.
pub(crate) struct ConnShared {
    pub remote_addr: SocketAddr,
    pub writer: Arc<tokio::sync::Mutex<MessageWriter<WriteHalf<BoxStream>>>>,
    pub channel_read_fns: Arc<Mutex<HashMap<u8, ChannelReadFn>>>,
    pub frames_enabled: AtomicBool,
    close_tx: mpsc::Sender<()>,
}

impl ConnShared {
    pub fn close(&self) {
        let _ = self.close_tx.try_send(());
    }
}

/// One task per TCP connection: decodes the mixed stream of requests,
/// responses and interleaved frames, routes requests to sessions and
/// dispatches frames to the interleaved session's callbacks.
pub(crate) struct ServerConnTask;

impl ServerConnTask {
    pub async fn run(server: Arc<ServerInner>, stream: BoxStream, remote_addr: SocketAddr) {
        let (r, w) = tokio::io::split(stream);
        let mut reader = MessageReader::new(r);
        let (close_tx, mut close_rx) = mpsc::channel(1);

        let shared = Arc::new(ConnShared {
            remote_addr,
            writer: Arc::new(tokio::sync::Mutex::new(MessageWriter::new(
                w,
                server.cfg.write_timeout,
            ))),
            channel_read_fns: Arc::new(Mutex::new(HashMap::new())),
            frames_enabled: AtomicBool::new(false),
            close_tx,
        });

        let mut sessions: HashMap<String, Arc<SessionShared>> = HashMap::new();
        let mut closed_rx = server.closed_rx();

        let res: Result<()> = loop {
            tokio::select! {
                msg = reader.read_message() => {
                    let msg = match msg {
                        Ok(m) => m,
                        Err(err) => break Err(err),
                    };
                    match msg {
                        Message::Request(req) => {
                            if let Err(err) =
                                handle_request(&server, &shared, &mut sessions, req).await
                            {
                                break Err(err);
                            }
                        }
                        // a stray response on a server connection is ignored
                        Message::Response(_) => {}
                        Message::Interleaved(frame) => {
                            if !shared.frames_enabled.load(Ordering::Relaxed) {
                                break Err(Error::ErrUnexpectedFrame);
                            }
                            let mut read_fns = shared.channel_read_fns.lock();
                            if let Some(read_fn) = read_fns.get_mut(&frame.channel) {
                                read_fn(&frame.payload);
                            }
                            // frames on unknown channels are dropped
                        }
                    }
                }
                _ = close_rx.recv() => break Ok(()),
                _ = closed_rx.changed() => break Ok(()),
            }
        };

        if let Err(err) = res {
            log::debug!("connection with {remote_addr} closed: {err}");
        }

        for session in sessions.values() {
            let _ = session.remove_conn_tx.send(remote_addr).await;
        }
    }
}

async fn handle_request(
    server: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    sessions: &mut HashMap<String, Arc<SessionShared>>,
    req: Request,
) -> Result<()> {
    let cseq = match req.headers.get("CSeq").map(str::to_string) {
        Some(v) => v,
        None => {
            let res = Response::new(StatusCode::BAD_REQUEST);
            shared.writer.lock().await.write_response(&res).await?;
            return Err(Error::ErrCSeqMissing);
        }
    };

    let session_id = req.session_id().map(str::to_string);

    let (mut res, action, target) = match &session_id {
        Some(id) => {
            let session = server.sessions.lock().get(id).cloned();
            match session {
                Some(session) => {
                    // DESCRIBE is connection-level even with a Session header
                    if req.method == Method::Describe {
                        (handle_describe(server, &req), HandleAction::None, None)
                    } else {
                        let (res, action) = route_to_session(&session, shared, req).await;
                        sessions.insert(id.clone(), Arc::clone(&session));
                        (res, action, Some(session))
                    }
                }
                None => (
                    Response::new(StatusCode::SESSION_NOT_FOUND),
                    HandleAction::None,
                    None,
                ),
            }
        }
        None => match req.method {
            Method::Options => (handle_options(server), HandleAction::None, None),
            Method::Describe => (handle_describe(server, &req), HandleAction::None, None),
            Method::GetParameter => {
                // connection-level keepalive
                (Response::new(StatusCode::OK), HandleAction::None, None)
            }
            Method::Announce | Method::Setup => {
                // an ANNOUNCE response carries no Session header, so the
                // following sessionless SETUPs are linked through the
                // connection
                let existing = if sessions.len() == 1 {
                    sessions.values().next().cloned()
                } else {
                    None
                };
                let session = match existing {
                    Some(session) => session,
                    None => {
                        let session = SessionShared::spawn(Arc::clone(server));
                        server
                            .sessions
                            .lock()
                            .insert(session.secret_id.clone(), Arc::clone(&session));
                        if let Some(cb) = &server.cfg.handlers.on_session_open {
                            cb(&super::ServerSession::from_shared(Arc::clone(&session)));
                        }
                        session
                    }
                };

                let (res, action) = route_to_session(&session, shared, req).await;
                sessions.insert(session.secret_id.clone(), Arc::clone(&session));
                (res, action, Some(session))
            }
            _ => (
                Response::new(StatusCode::SESSION_NOT_FOUND),
                HandleAction::None,
                None,
            ),
        },
    };

    res.headers.set("CSeq", cseq);
    shared.writer.lock().await.write_response(&res).await?;

    match (action, target) {
        (HandleAction::SwitchToInterleaved, Some(session)) => {
            shared.frames_enabled.store(true, Ordering::Relaxed);
            // the writer is started only after the response is on the wire
            let _ = session.start_writer_tx.try_send(());
        }
        (HandleAction::SwitchFromInterleaved, _) => {
            shared.frames_enabled.store(false, Ordering::Relaxed);
        }
        (HandleAction::TearDown, Some(session)) => {
            shared.frames_enabled.store(false, Ordering::Relaxed);
            sessions.remove(&session.secret_id);
            session.close(Error::ErrSessionTornDown);
        }
        _ => {}
    }

    Ok(())
}

async fn route_to_session(
    session: &Arc<SessionShared>,
    conn: &Arc<ConnShared>,
    req: Request,
) -> (Response, HandleAction) {
    let (res_tx, res_rx) = oneshot::channel();
    let job = SessionJob {
        conn: Arc::clone(conn),
        req,
        res_tx,
    };

    if session.request_tx.send(job).await.is_err() {
        return (
            Response::new(StatusCode::SESSION_NOT_FOUND),
            HandleAction::None,
        );
    }

    match res_rx.await {
        Ok(v) => v,
        Err(_) => (
            Response::new(StatusCode::SESSION_NOT_FOUND),
            HandleAction::None,
        ),
    }
}

pub(crate) fn handle_options(server: &Arc<ServerInner>) -> Response {
    let h = &server.cfg.handlers;
    let mut methods = vec![Method::Options.as_str()];
    if h.on_describe.is_some() {
        methods.push(Method::Describe.as_str());
    }
    if h.on_announce.is_some() {
        methods.push(Method::Announce.as_str());
    }
    methods.push(Method::Setup.as_str());
    if h.on_play.is_some() {
        methods.push(Method::Play.as_str());
    }
    if h.on_record.is_some() {
        methods.push(Method::Record.as_str());
    }
    if h.on_pause.is_some() {
        methods.push(Method::Pause.as_str());
    }
    methods.push(Method::GetParameter.as_str());
    if h.on_set_parameter.is_some() {
        methods.push(Method::SetParameter.as_str());
    }
    methods.push(Method::Teardown.as_str());

    let mut res = Response::new(StatusCode::OK);
    res.headers.set("Public", methods.join(", "));
    res
}

fn handle_describe(server: &Arc<ServerInner>, req: &Request) -> Response {
    let cb = match &server.cfg.handlers.on_describe {
        Some(cb) => cb,
        None => return Response::new(StatusCode::NOT_IMPLEMENTED),
    };

    let ctx = DescribeContext {
        path: req.url.path(),
        query: req.url.query(),
        url: req.url.clone(),
    };

    match cb(&ctx) {
        Ok(stream) => {
            let mut res = Response::new(StatusCode::OK);
            res.headers.set("Content-Type", "application/sdp");
            res.headers
                .set("Content-Base", format!("{}/", req.url.as_str().trim_end_matches('/')));
            res.body = stream
                .description()
                .marshal(server.secure())
                .into();
            res
        }
        Err(status) => Response::new(status),
    }
}
