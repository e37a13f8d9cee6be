use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "pdf-autosign",
    version,
    about = "Detect, fill and sign PDF form fields with a vision model"
)]
struct Cli {
    /// PDF document to fill
    #[arg(short = 'd', long = "data")]
    data: Option<String>,

    /// Mime type for --data (auto or application/pdf)
    #[arg(short = 'M', long = "data-mime")]
    data_mime: Option<String>,

    /// Signer name used to render the signature and initials
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Signature style (classic, modern, artistic)
    #[arg(short = 's', long = "style")]
    style: Option<String>,

    /// Sign every signature and initial field
    #[arg(long = "sign-all")]
    sign_all: bool,

    /// Fill the nth text field of a page (PAGE:INDEX=TEXT, one-based)
    #[arg(short = 'f', long = "fill-page")]
    fill_page: Vec<String>,

    /// Print the detected fields
    #[arg(short = 'l', long = "list-fields")]
    list_fields: bool,

    /// Output PDF path (default: export.output_name)
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Model name or provider:model (e.g. gemini:MODEL_ID)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// API key (overrides environment variables)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,

    /// Serve the HTTP API (optionally on ADDR, default: server.addr)
    #[arg(long = "server", value_name = "ADDR", num_args = 0..=1, default_missing_value = "")]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pdf_autosign::logging::init(cli.verbose)?;

    let config = pdf_autosign::Config {
        data: cli.data,
        data_mime: cli.data_mime,
        name: cli.name,
        style: cli.style,
        sign_all: cli.sign_all,
        fill_pages: cli.fill_page,
        list_fields: cli.list_fields,
        output: cli.output,
        model: cli.model,
        key: cli.key,
        settings_path: cli.read_settings,
    };

    if let Some(addr) = cli.server {
        return pdf_autosign::serve(config, Some(addr)).await;
    }

    let output = pdf_autosign::run(config).await?;
    println!("{}", output);
    Ok(())
}
