use eyre::{Context, OptionExt, bail};
use oauth2::basic::BasicTokenResponse;
use std::io::IsTerminal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use youtube_data::auth::authorization_code_from;
use youtube_data::{Client, ListQuery, Resource, device_login, scopes};

const USAGE: &str = "\
usage: youtube-data-cli <command>

commands:
  device-login                     authorize with a code entered on another device
  web-login                        authorize in the browser and paste the code back
  refresh                          trade YOUTUBE_REFRESH_TOKEN for a new access token
  revoke <token>                   revoke an access or refresh token
  list <resource> <part> [k=v ..]  print every item of a collection, one JSON object per line

credentials are read from YOUTUBE_API_KEY, YOUTUBE_CLIENT_ID, YOUTUBE_CLIENT_SECRET,
YOUTUBE_ACCESS_TOKEN and YOUTUBE_REFRESH_TOKEN";

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("{USAGE}");
        bail!("no command given");
    };

    let client = Client::from_env();
    match command.as_str() {
        "device-login" => {
            let token = device_login(&client, &[scopes::YOUTUBE], async |code| {
                eprintln!(
                    "visit {} and enter the code {}",
                    code.verification_url.as_deref().unwrap_or("https://www.google.com/device"),
                    code.user_code.as_deref().unwrap_or("(none)")
                );
            })
            .await?;
            print_token(&token)?;
        }
        "web-login" => {
            let url = client
                .authorization_url(&[scopes::YOUTUBE])
                .context("build authorization url")?;
            eprintln!("opening {url}");
            if let Err(e) = webbrowser::open(url.as_str()) {
                tracing::warn!(error = %e, "could not open a browser, visit the url manually");
            }
            eprintln!("paste the authorization code (or the address it was shown at):");
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let code = lines
                .next_line()
                .await
                .context("read authorization code")?
                .ok_or_eyre("no authorization code given")?;

            let auth = client.authentication_request();
            auth.exchange_code_for_access_token(&authorization_code_from(&code))
                .await
                .context("exchange authorization code")?;
            let token = auth.token().ok_or_eyre("token response is incomplete")?;
            print_token(&token)?;
        }
        "refresh" => {
            let auth = client.authentication_request();
            auth.refresh_access_token()
                .await
                .context("refresh access token")?;
            let token = auth.token().ok_or_eyre("token response is incomplete")?;
            print_token(&token)?;
        }
        "revoke" => {
            let [token] = rest else {
                bail!("usage: youtube-data-cli revoke <token>");
            };
            client
                .authentication_request()
                .revoke_access_token(token)
                .await
                .context("revoke token")?;
            eprintln!("token revoked");
        }
        "list" => {
            let [resource, part, filters @ ..] = rest else {
                bail!("usage: youtube-data-cli list <resource> <part> [key=value ...]");
            };
            let resource: Resource = resource.parse()?;
            let parts: Vec<&str> = part.split(',').collect();
            let mut query = ListQuery::new(&parts);
            for filter in filters {
                let (key, value) = filter
                    .split_once('=')
                    .ok_or_else(|| eyre::eyre!("expected key=value, got {filter:?}"))?;
                query = query.filter(key, value);
            }

            let model = client.list_model(resource);
            model
                .list(query)
                .await
                .with_context(|| format!("list {resource}"))?;
            while model.can_fetch_more() {
                model
                    .fetch_more()
                    .await
                    .with_context(|| format!("fetch more {resource}"))?;
            }
            for item in model.items() {
                println!("{item}");
            }
            tracing::info!(items = model.len(), %resource, "done");
        }
        other => {
            eprintln!("{USAGE}");
            bail!("unknown command {other:?}");
        }
    }
    Ok(())
}

fn print_token(token: &BasicTokenResponse) -> eyre::Result<()> {
    let json = serde_json::to_string_pretty(token).context("serialize token")?;
    println!("{json}");
    Ok(())
}
