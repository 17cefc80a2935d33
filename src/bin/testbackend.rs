//! Toy backend for exercising the gateway locally. Answers every path with
//! a JSON body naming the port that served it.

use axum::extract::Request;
use axum::response::IntoResponse;
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "testbackend")]
#[command(about = "Toy HTTP backend for gateway testing")]
struct Args {
    #[arg(short, long, default_value_t = 9001)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt().init();

    let port = args.port;
    let app = Router::new().fallback(move |req: Request| async move {
        info!(method = %req.method(), path = %req.uri().path(), port, "backend hit");
        Json(json!({
            "message": "Hello from backend",
            "port": port,
            "path": req.uri().path(),
        }))
        .into_response()
    });

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "test backend listening");
    axum::serve(listener, app).await?;
    Ok(())
}
