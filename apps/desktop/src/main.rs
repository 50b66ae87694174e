use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    AccountClient, CandidateFile, FeedbackSink, InMemoryPreviewRegistry, InMemorySessionStore,
    SessionStore,
};
use shared::protocol::Credentials;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    /// Optional image to upload as the new profile photo after signing in.
    #[arg(long)]
    avatar: Option<PathBuf>,
}

/// Stand-in for the toast surface: feedback goes to stdout.
struct StdoutFeedback;

impl FeedbackSink for StdoutFeedback {
    fn notify_success(&self, message: &str) {
        println!("ok: {message}");
    }

    fn notify_error(&self, message: &str) {
        println!("error: {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let store = Arc::new(InMemorySessionStore::new());
    let client = AccountClient::new_with_dependencies(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        Arc::new(StdoutFeedback),
    );

    let user = client
        .login(
            &args.server_url,
            Credentials::new(&args.email, &args.password),
        )
        .await?;
    println!("Signed in as user_id={} email={}", user.user_id.0, user.email);

    if let Some(path) = args.avatar {
        let bytes = std::fs::read(&path)?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("avatar.png")
            .to_string();

        let surface = client.begin_avatar_change(Arc::new(InMemoryPreviewRegistry::new()));
        surface
            .stage_files(vec![CandidateFile::new(filename, None, bytes)])
            .await?;
        let updated = surface.submit().await?;
        surface.close().await;
        println!(
            "Profile photo now {}",
            updated.avatar_url.as_deref().unwrap_or("unset")
        );
    }

    Ok(())
}
