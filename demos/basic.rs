//! Small notes service: JSON and form endpoints over SQLite, plus one HTML
//! page rendered from `demos/templates`.
//!
//! Run with:
//!   DATABASE_URL=sqlite::memory: DATABASE_MAX_CONNECTIONS=1 LOG_LEVEL=debug \
//!     cargo run --example basic
//!
//! Try:
//!   curl -X POST http://localhost:3000/notes \
//!        -H 'content-type: application/json' \
//!        -d '{"title":"milk","body":"2 litres"}'
//!   curl -X POST http://localhost:3000/notes -d 'title=eggs&body=a+dozen'
//!   curl -X POST http://localhost:3000/notes -F title=tea -F body=green
//!   curl http://localhost:3000/notes/1
//!   curl http://localhost:3000/notes?limit=10
//!   curl http://localhost:3000/

use std::sync::Arc;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use toolkit::db::{self, Conn, Params};
use toolkit::template::{self, TemplateSet};
use toolkit::{ContentType, HttpError, Request, ResponseWriter, Router, Server, ServerConfig};
use toolkit::{decode, logging, middleware, response};

#[derive(Deserialize)]
struct NewNote {
    title: String,
    body: String,
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

#[derive(Serialize, sqlx::FromRow)]
struct Note {
    id: i64,
    title: String,
    body: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&logging::Config::from_env()?)?;

    let conn = Conn::connect(&db::Config::from_env()?).await?;
    conn.exec(
        "CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT NOT NULL)",
        Params::new(),
    )
    .await?;

    let templates = Arc::new(TemplateSet::load(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/templates"))?);

    let config = ServerConfig::from_env()?;
    let app = Router::new()
        .body_limit(config.max_body)
        .layer(middleware::request_logger())
        .layer(middleware::recoverer())
        .layer(db::middleware(conn))
        .layer(template::middleware(templates))
        .get("/", index)
        .get("/notes", list_notes)
        .post("/notes", create_note)
        .get("/notes/{id}", get_note);

    Server::bind(config.addr).serve(app).await?;
    Ok(())
}

// GET /
async fn index(w: ResponseWriter, req: Request) -> Result<(), HttpError> {
    let notes: Vec<Note> = db::select(req.context(), "SELECT id, title, body FROM notes ORDER BY id", Params::new()).await?;
    response::write_status(&w, StatusCode::OK, Some(ContentType::Html));
    template::render(req.context(), &w, "index", &serde_json::json!({ "notes": notes }));
    Ok(())
}

// GET /notes?limit=N
async fn list_notes(w: ResponseWriter, req: Request) -> Result<(), HttpError> {
    let query: ListQuery = decode(&req)?;
    let notes: Vec<Note> = db::select(
        req.context(),
        "SELECT id, title, body FROM notes ORDER BY id LIMIT $1",
        Params::new().bind(query.limit.unwrap_or(100)),
    )
    .await?;
    Ok(response::render_json(&w, &notes)?)
}

// POST /notes, JSON, form or multipart body
async fn create_note(w: ResponseWriter, req: Request) -> Result<(), HttpError> {
    let input: NewNote = decode(&req)?;

    let note: Note = db::transaction(req.context(), |ctx| {
        Box::pin(async move {
            db::exec(
                ctx,
                "INSERT INTO notes (title, body) VALUES ($1, $2)",
                Params::new().bind(input.title.as_str()).bind(input.body.as_str()),
            )
            .await?;
            db::get(ctx, "SELECT id, title, body FROM notes ORDER BY id DESC LIMIT 1", Params::new()).await
        })
    })
    .await?;

    w.set_header(http::header::LOCATION, format!("/notes/{}", note.id).parse()?);
    response::write_status(&w, StatusCode::CREATED, Some(ContentType::Json));
    w.write(&serde_json::to_vec_pretty(&note)?)?;
    Ok(())
}

// GET /notes/{id}
async fn get_note(w: ResponseWriter, req: Request) -> Result<(), HttpError> {
    let id: i64 = req
        .param("id")
        .unwrap_or_default()
        .parse()
        .map_err(|e| HttpError::new(StatusCode::BAD_REQUEST, e))?;

    match db::get::<Note>(req.context(), "SELECT id, title, body FROM notes WHERE id = $1", Params::new().bind(id)).await {
        Ok(note) => Ok(response::render_json(&w, &note)?),
        Err(db::Error::Sqlx(sqlx::Error::RowNotFound)) => {
            Err(HttpError::new(StatusCode::NOT_FOUND, format!("no note {id}")))
        }
        Err(e) => Err(e.into()),
    }
}
