use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;

use rotation::api::ApiClient;
use rotation::config::Config;
use rotation::observer::QueueObserver;
use rotation::projection::Projection;
use rotation::session::Session;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let event_id: i64 = args
        .next()
        .ok_or_else(|| anyhow!("usage: rotation <event-id> [--host]"))?
        .parse()
        .context("event id must be an integer")?;
    let host_mode = args.any(|a| a == "--host");

    let config = Config::load()?;
    let mut client = ApiClient::new(&config)?;

    if host_mode {
        let session = Session::load()?
            .filter(|s| !s.is_expired())
            .ok_or_else(|| anyhow!("host mode needs a saved session, log in first"))?;
        client = client.with_session(session);
    }
    let client = Arc::new(client);

    let (update_tx, mut updates) = mpsc::unbounded_channel::<Projection>();
    let on_update = move |projection: Projection| {
        let _ = update_tx.send(projection);
    };

    let observer = if host_mode {
        QueueObserver::host(Arc::clone(&client), &config, event_id, on_update).await
    } else {
        QueueObserver::public(Arc::clone(&client), &config, event_id, on_update).await
    };

    println!(
        "Watching event {event_id} ({}), Ctrl-C to quit",
        if host_mode { "host" } else { "public" }
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(view) = updates.recv() => print_projection(&view),
        }
    }

    observer.close().await;
    Ok(())
}

fn print_projection(view: &Projection) {
    match &view.current {
        Some(current) => {
            let label = current
                .song
                .as_ref()
                .map(|s| format!("{} — {}", s.artist, s.title))
                .unwrap_or_else(|| format!("song #{}", current.song_id));
            println!("Now singing: {} ({label})", current.requester_name);
        }
        None => println!("Now singing: —"),
    }

    if view.upcoming.is_empty() {
        println!("  Rotation empty");
    } else {
        for (i, entry) in view.upcoming.iter().enumerate() {
            println!("  {:>2}. {}", i + 1, entry.requester_name);
        }
    }
}
