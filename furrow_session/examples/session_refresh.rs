use std::time::Duration;

use clap::Parser;
use furrow_clock::{Clock, System};
use furrow_session::{
    derive_id, sources::SessionTokenEndpoint, token, ApiKey, BackendConfig, RefreshConfig,
    SecretKey, SessionId, SessionManager, TemplateName, TokenStatus,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The identity provider's API base URL
    #[clap(long, env)]
    identity_api_url: reqwest::Url,

    /// The signed-in session to mint tokens for
    #[clap(long, env)]
    session_id: SessionId,

    /// The secret key used to authenticate with the identity provider
    #[clap(long, env, hide_env_values = true)]
    secret_key: SecretKey,

    /// The token template configured for the data backend
    #[clap(long, env, default_value = "backend")]
    template: TemplateName,

    /// The data backend's base URL
    #[clap(long, env)]
    backend_url: reqwest::Url,

    /// The data backend's public API key
    #[clap(long, env, hide_env_values = true)]
    backend_api_key: ApiKey,

    /// The identity provider's identifier for the signed-in user
    #[clap(long, env)]
    user_id: Option<String>,

    /// Confirm each new session with the data backend before installing it
    #[clap(long, env)]
    verify_sessions: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;

    let provider = SessionTokenEndpoint::new(
        client,
        opts.identity_api_url,
        opts.session_id,
        opts.secret_key,
    );

    let mut backend = BackendConfig::new(opts.backend_url, opts.backend_api_key);
    if opts.verify_sessions {
        backend = backend.verifying_sessions();
    }

    if let Some(user_id) = &opts.user_id {
        let stable_id = derive_id(user_id);
        tracing::info!(
            %stable_id,
            avatar_path = %stable_id.object_path("avatar.png"),
            "derived stable user id"
        );
    }

    let config = RefreshConfig::default().with_template(opts.template);
    let mut manager = SessionManager::new(provider, backend, config);

    let outcome = manager.initialize().await;
    tracing::info!(?outcome, "session initialization finished");

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {}
        }

        let Some(token) = manager.cache().current_token() else {
            tracing::warn!(state = ?manager.state(), "no authenticated client available");
            continue;
        };

        let parsed = token::parse(&token, &System);
        let status = token::status_of(&parsed);
        let expiry = manager.cache().current_expiry().map(|t| t.0);
        let remaining = manager
            .cache()
            .current_expiry()
            .map(|t| System.now().seconds_until(t));

        match status {
            TokenStatus::Fresh => {
                tracing::debug!(
                    ?status,
                    state = ?manager.state(),
                    token = format_args!("{:#?}", token),
                    expiry,
                    remaining,
                    "pulled token"
                )
            }
            TokenStatus::ExpiringSoon => {
                tracing::warn!(
                    ?status,
                    state = ?manager.state(),
                    token = format_args!("{:#?}", token),
                    expiry,
                    remaining,
                    "pulled token"
                )
            }
            TokenStatus::Expired => {
                tracing::error!(
                    ?status,
                    state = ?manager.state(),
                    token = format_args!("{:#?}", token),
                    expiry,
                    remaining,
                    "pulled token"
                )
            }
        }
    }

    manager.teardown().await;
    Ok(())
}
