use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use invoice_delivery::auth::{
    CredentialProvider, FileSessionStore, OAuthClient, SessionRecord, SessionStore, TokenEndpoint,
};
use invoice_delivery::config::AppConfig;
use invoice_delivery::dispatch::DispatchService;
use invoice_delivery::invoice::FileInvoiceRepository;
use invoice_delivery::renderer::ChromeRenderer;
use invoice_delivery::{DeliveryPipeline, DeliveryRequest, DeliverySettings};

#[derive(Parser)]
#[command(name = "invoice-delivery")]
#[command(about = "Rendu PDF et envoi des factures par email")]
#[command(version = "0.1.0")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Génère le PDF d'une facture et l'envoie par email
    Send {
        invoice_id: String,

        /// Destinataire (répétable)
        #[arg(long = "to", required = true)]
        to: Vec<String>,

        #[arg(long)]
        subject: String,

        /// Corps du message
        #[arg(long, conflicts_with = "body_file")]
        body: Option<String>,

        /// Fichier contenant le corps du message
        #[arg(long)]
        body_file: Option<PathBuf>,

        /// Session mailer (OAuth2 uniquement)
        #[arg(long)]
        session: Option<String>,
    },

    /// Génère seulement le PDF d'une facture
    Pdf {
        invoice_id: String,

        /// Fichier de sortie (par défaut: <id>.pdf)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Affiche l'état d'une session mailer
    Session {
        #[arg(long)]
        session: String,
    },

    /// Supprime une session mailer
    Logout {
        #[arg(long)]
        session: String,
    },

    /// Affiche l'URL de connexion Google
    LoginUrl,

    /// Termine la connexion Google avec le code reçu sur l'URL de retour
    Login {
        #[arg(long)]
        code: String,
    },

    /// Vérifier la configuration sans rien envoyer
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Charger le fichier .env s'il existe
    dotenv::dotenv().ok();

    let args = Args::parse();

    env_logger::init();

    let config = AppConfig::new()?;

    // Ctrl-C annule l'opération en cours
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️  Interruption reçue, annulation en cours...");
            on_signal.cancel();
        }
    });

    match args.command {
        Command::Send { invoice_id, to, subject, body, body_file, session } => {
            let body = match (body, body_file) {
                (Some(body), _) => body,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Unable to read body file {}", path.display()))?,
                (None, None) => String::new(),
            };
            let request = DeliveryRequest {
                invoice_id,
                session_id: session,
                recipients: to,
                subject,
                body,
            };
            send(&config, request, &cancel).await
        }
        Command::Pdf { invoice_id, output } => export(&config, &invoice_id, output, &cancel).await,
        Command::Session { session } => {
            let credentials = credential_provider(&config)?;
            let status = credentials.session_status(&session).await?;
            println!("🔐 Méthode: {}", status.method.as_str());
            match status.email {
                Some(email) => println!("✅ Connecté: {}", email),
                None => println!("❌ Non connecté"),
            }
            Ok(())
        }
        Command::Logout { session } => {
            let credentials = credential_provider(&config)?;
            match credentials.logout(&session).await? {
                Some(email) => println!("👋 Session de {} supprimée", email),
                None => println!("Aucune session active"),
            }
            Ok(())
        }
        Command::LoginUrl => {
            let client = oauth_client(&config)?;
            let state = uuid::Uuid::new_v4().simple().to_string();
            println!("{}", client.authorize_url(&state)?);
            Ok(())
        }
        Command::Login { code } => login(&config, &code, &cancel).await,
        Command::CheckConfig => {
            check_config(&config);
            Ok(())
        }
    }
}

async fn send(config: &AppConfig, request: DeliveryRequest, cancel: &CancellationToken) -> Result<()> {
    let credentials = Arc::new(credential_provider(config)?);
    let pipeline = DeliveryPipeline::new(
        Arc::new(ChromeRenderer::from_settings(&config.renderer)),
        credentials.clone(),
        Arc::new(DispatchService::new(config.smtp.clone())),
        Arc::new(FileInvoiceRepository::new(&config.storage.invoices)),
        DeliverySettings::from_config(config),
    );

    let report = pipeline.deliver(&request, cancel).await;
    info!(
        "Transitions: {}",
        report.transitions.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
    );

    match report.into_result() {
        Ok(ack) => {
            println!("✅ Facture {} envoyée ({} {})", request.invoice_id, ack.code, ack.message);
            Ok(())
        }
        Err(e) => {
            if e.requires_reauthentication() {
                if let Some(session) = &request.session_id {
                    if let Err(logout_err) = credentials.logout(session).await {
                        error!("Unable to clear session {}: {}", session, logout_err);
                    }
                }
                println!("🔐 Session mailer expirée, veuillez vous reconnecter (login-url)");
            }
            Err(e).with_context(|| format!("Failed to send invoice {}", request.invoice_id))
        }
    }
}

async fn export(config: &AppConfig, invoice_id: &str, output: Option<PathBuf>, cancel: &CancellationToken) -> Result<()> {
    let pipeline = DeliveryPipeline::new(
        Arc::new(ChromeRenderer::from_settings(&config.renderer)),
        Arc::new(credential_provider(config)?),
        Arc::new(DispatchService::new(config.smtp.clone())),
        Arc::new(FileInvoiceRepository::new(&config.storage.invoices)),
        DeliverySettings::from_config(config),
    );

    let document = pipeline
        .export_document(invoice_id, cancel)
        .await
        .with_context(|| format!("Failed to generate pdf for invoice {}", invoice_id))?;

    let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.pdf", invoice_id)));
    tokio::fs::write(&output, document.bytes())
        .await
        .with_context(|| format!("Unable to write {}", output.display()))?;
    println!("📄 {} ({} octets)", output.display(), document.len());
    Ok(())
}

async fn login(config: &AppConfig, code: &str, cancel: &CancellationToken) -> Result<()> {
    let client = oauth_client(config)?;
    let tokens = client.exchange_code(code, cancel).await.context("Code exchange failed")?;
    let email = client
        .account_email(&tokens.access_token, cancel)
        .await
        .context("Unable to read account email")?;

    let session_id = uuid::Uuid::new_v4().simple().to_string();
    let record = SessionRecord {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expiry: tokens.expiry,
        account_email: email,
    };
    FileSessionStore::new(&config.storage.sessions)
        .set(&session_id, &record)
        .await
        .context("Unable to save mailer session")?;

    info!("✅ User logged in: {}", record.account_email);
    println!("✅ Connecté: {}", record.account_email);
    println!("🔑 Session: {}", session_id);
    Ok(())
}

fn credential_provider(config: &AppConfig) -> Result<CredentialProvider> {
    let sessions: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(&config.storage.sessions));
    let tokens = config
        .oauth
        .clone()
        .map(|settings| Arc::new(OAuthClient::new(settings)) as Arc<dyn TokenEndpoint>);
    Ok(CredentialProvider::from_config(config, sessions, tokens)?)
}

fn oauth_client(config: &AppConfig) -> Result<OAuthClient> {
    let settings = config
        .oauth
        .clone()
        .context("GOOGLE_OAUTH_CLIENT_ID and GOOGLE_OAUTH_CLIENT_SECRET must be set")?;
    Ok(OAuthClient::new(settings))
}

fn check_config(config: &AppConfig) {
    println!("✅ Configuration valide !");
    println!("💾 Stockage: {}", config.storage.root.display());
    println!("🌐 URL publique: {}", config.public_url);
    match &config.renderer.remote_url {
        Some(url) => println!("🖨️  Chrome distant: {}", url),
        None => println!(
            "🖨️  Chrome local: {}",
            config
                .renderer
                .executable
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "recherche dans le PATH".to_string())
        ),
    }
    println!("📐 Format: {}", config.renderer.paper);
    match config.smtp.endpoint() {
        Ok(endpoint) => println!("📧 SMTP: {}:{} ({:?})", endpoint.host, endpoint.port, endpoint.tls),
        Err(e) => println!("⚠️  SMTP: {}", e),
    }
    println!("🔐 Authentification: {}", config.auth_method.as_str());
}
