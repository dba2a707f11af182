use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_std::channel::{self, Receiver};
use async_std::future;
use async_std::task;
use log::{info, warn};

use tide::{Endpoint, Request, Response, StatusCode};
use tide::http::mime;
use tide_websockets::{WebSocket, WebSocketConnection};

use crate::types::DocId;
use crate::frames::{read_user, RequestStream};
use crate::protocol::{self, Response as SessionResponse};
use crate::server::Server;
use crate::session::Session;

pub type State = Arc<Server>;

const EDIT_PAGE: &str = r#"<html>
    <head>
        <script src="/dist/main.js" type="module"></script>
    </head>
    <body>
        <center>
            <textarea id="textbox" name="textbox" rows="45" cols="150" disabled></textarea>
        </center>
    </body>
</html>"#;

fn parse_doc_id(req: &Request<State>) -> tide::Result<DocId> {
    req.param("id")?
        .parse()
        .map_err(|_| tide::Error::from_str(StatusCode::BadRequest, "Malformed id"))
}

async fn edit(req: Request<State>) -> tide::Result {
    let id = parse_doc_id(&req)?;
    if req.state().ensure_document(id).await {
        info!("created document {}", id);
    }

    Ok(Response::builder(StatusCode::Ok)
        .content_type(mime::HTML)
        .body(EDIT_PAGE)
        .build())
}

/**
 * Owns the write half of the socket; `send` puts one text frame on the wire. Stops at the first
 * failed or timed out write and marks the session dead, which makes everything still queued for
 * this client get dropped.
 */
async fn write_responses<F, Fut, E>(send: F, outbound: Receiver<SessionResponse>, session: Arc<Session>, write_timeout: Duration)
    where F: Fn(String) -> Fut, Fut: Future<Output = Result<(), E>>, E: Display
{
    while let Ok(res) = outbound.recv().await {
        if !session.is_alive() { break; }

        let text = match protocol::encode_response(&res) {
            Ok(text) => text,
            Err(e) => {
                warn!("could not encode {:?}: {}", res, e);
                continue;
            }
        };

        match future::timeout(write_timeout, send(text)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                warn!("write failed: {}", e);
                break;
            },
            Err(_) => {
                warn!("write timed out");
                break;
            },
        }
    }

    session.mark_dead();
}

async fn run_session(req: Request<State>, conn: WebSocketConnection) -> tide::Result<()> {
    let doc_id = parse_doc_id(&req)?;
    let server = req.state().clone();

    let mut frames = conn.clone();
    let user = match read_user(&mut frames).await? {
        Some(user) => user,
        None => return Ok(()),
    };
    info!("{} joined document {}", user, doc_id);

    let session = Arc::new(Session::new(server.clone(), doc_id, user));
    let (sender, receiver) = channel::unbounded();
    let send = move |text: String| {
        let conn = conn.clone();
        async move { conn.send_string(text).await }
    };
    let writer = task::spawn(write_responses(send, receiver, session.clone(), server.config.write_timeout));

    session.clone().serve(RequestStream::new(frames), sender).await;
    writer.await;

    info!("session on document {} closed", doc_id);
    Ok(())
}

pub fn app(server: State) -> tide::Server<State> {
    let mut app = tide::with_state(server);

    app.at("/edit/:id").get(edit);

    let ws = Arc::new(WebSocket::new(run_session));
    app.at("/ws/:id").get(move |req: Request<State>| {
        let ws = ws.clone();
        async move {
            // Bad ids get a 400 before the upgrade rather than a socket we immediately close.
            let id = parse_doc_id(&req)?;
            req.state().ensure_document(id).await;
            ws.call(req).await
        }
    });

    app
}

pub async fn host(server: State, addr: String) -> std::io::Result<()> {
    let app = app(server);
    info!("listening on {}", addr);
    app.listen(addr).await
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_std::channel::Sender;
    use tide::http::{Method, Request as HttpRequest, Response as HttpResponse, Url};
    use crate::config::ServerConfig;

    async fn get(app: &tide::Server<State>, path: &str) -> HttpResponse {
        let url = Url::parse("http://localhost").unwrap().join(path).unwrap();
        app.respond(HttpRequest::new(Method::Get, url)).await.unwrap()
    }

    #[async_std::test]
    async fn edit_creates_the_document() {
        let server = Arc::new(Server::new(ServerConfig::default()));
        let app = app(server.clone());

        let mut res = get(&app, "/edit/42").await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert!(res.body_string().await.unwrap().contains("textbox"));
        assert_eq!(server.document(42).await.unwrap().view, 0);
    }

    fn writer_fixture() -> (Arc<Session>, Sender<SessionResponse>, Receiver<SessionResponse>) {
        let server = Arc::new(Server::new(ServerConfig::default()));
        let session = Arc::new(Session::new(server, 1, "seph".into()));
        let (sender, receiver) = channel::unbounded();
        (session, sender, receiver)
    }

    #[async_std::test]
    async fn failed_write_kills_the_session() {
        let (session, sender, receiver) = writer_fixture();
        for seq in 0..3 {
            sender.send(SessionResponse::Ack { seq }).await.unwrap();
        }
        drop(sender);

        let sent = Arc::new(StdMutex::new(Vec::new()));
        let record = sent.clone();
        let send = move |text: String| {
            let mut sent = record.lock().unwrap();
            sent.push(text);
            let n = sent.len();
            async move { if n < 2 { Ok(()) } else { Err("connection reset") } }
        };

        write_responses(send, receiver, session.clone(), Duration::from_secs(5)).await;
        assert!(!session.is_alive());
        // The third ack is never attempted.
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], r#"{"type":"Ack","seq":0}"#);
    }

    #[async_std::test]
    async fn stalled_write_times_out() {
        let (session, sender, receiver) = writer_fixture();
        sender.send(SessionResponse::Ack { seq: 0 }).await.unwrap();

        let send = |_: String| future::pending::<Result<(), String>>();
        write_responses(send, receiver, session.clone(), Duration::from_millis(20)).await;
        assert!(!session.is_alive());
    }

    #[async_std::test]
    async fn dead_sessions_send_nothing() {
        let (session, sender, receiver) = writer_fixture();
        sender.send(SessionResponse::Ack { seq: 0 }).await.unwrap();
        drop(sender);
        session.mark_dead();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let send = move |_: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), String>(()) }
        };
        write_responses(send, receiver, session, Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[async_std::test]
    async fn malformed_ids_are_rejected() {
        let server = Arc::new(Server::new(ServerConfig::default()));
        let app = app(server.clone());

        assert_eq!(get(&app, "/edit/nope").await.status(), StatusCode::BadRequest);
        assert_eq!(get(&app, "/ws/-1").await.status(), StatusCode::BadRequest);
        assert_eq!(server.document(0).await, None);
    }
}
