use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};
use restyle_contracts::chat::{parse_directive, Directive, CHAT_HELP};
use restyle_contracts::events::EventPayload;
use restyle_contracts::products::Product;
use restyle_engine::{
    placeholder_products, require_secret, AssistantClient, ConfigError, HostedDiffusionGenerator,
    ProductResolver, ProductSource, RedesignEngine, RedesignOutcome, VisionAnnotator, VisionClient,
};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "restyle-rs", version, about = "Room redesign pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Redesign a room photo in one shot and print product suggestions.
    Redesign(RedesignArgs),
    /// Print the vision analysis of a room photo as JSON.
    Analyze(AnalyzeArgs),
    /// Look up shoppable products for a single label.
    Products(ProductsArgs),
    /// Interactive session: chat with the assistant and drive redesigns.
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct RedesignArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    style: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "hosted-sd")]
    generator: String,
    /// Print the trending style list before running.
    #[arg(long)]
    inspire: bool,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct ProductsArgs {
    #[arg(long)]
    label: String,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "hosted-sd")]
    generator: String,
}

const TRENDING_STYLES: &[&str] = &[
    "Scandinavian Minimalism",
    "Boho Chic",
    "Modern Farmhouse",
    "Japandi",
    "Industrial Loft",
    "Mid-century Modern",
    "Contemporary Luxe",
];

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("restyle-rs error: {err:#}");
            process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Redesign(args) => run_redesign(args),
        Command::Analyze(args) => run_analyze(args),
        Command::Products(args) => run_products(args),
        Command::Chat(args) => run_chat(args),
    }
}

fn run_redesign(args: RedesignArgs) -> Result<i32> {
    require_secrets(&["GOOGLE_VISION_API_KEY", "SERPAPI_KEY"])?;
    require_generation_credentials(&args.generator)?;

    if args.inspire {
        println!("Need inspiration? Try a trending style:");
        for style in TRENDING_STYLES {
            println!("- {style}");
        }
    }

    let events_path = default_events_path(&args.out, args.events.clone());
    let mut engine = RedesignEngine::from_env(&args.out, &events_path, args.generator.clone())?;
    engine.load_room(&args.image)?;
    let outcome = engine.redesign(&args.style)?;
    print_outcome(&outcome);
    Ok(0)
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    require_secrets(&["GOOGLE_VISION_API_KEY"])?;
    let vision = VisionClient::from_env()?;
    let image = image::open(&args.image)?;
    let analysis = vision.annotate(&image)?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(0)
}

fn run_products(args: ProductsArgs) -> Result<i32> {
    require_secrets(&["SERPAPI_KEY"])?;
    let resolver = ProductResolver::from_env()?;
    let products = resolve_soft(&resolver, &args.label);
    if products.is_empty() {
        println!("No products found for '{}'.", args.label);
    }
    for product in &products {
        println!("{}", product_line(product));
    }
    Ok(0)
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    require_secrets(&["GROQ_API_KEY", "GOOGLE_VISION_API_KEY", "SERPAPI_KEY"])?;
    require_generation_credentials(&args.generator)?;

    let events_path = default_events_path(&args.out, args.events.clone());
    let mut engine = RedesignEngine::from_env(&args.out, &events_path, args.generator.clone())?;
    let assistant = AssistantClient::from_env()?;
    let resolver = ProductResolver::from_env()?;

    print_help();
    let stdin = io::stdin();
    loop {
        print!("you> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match parse_directive(&line) {
            Directive::Noop => continue,
            Directive::Quit => break,
            Directive::Help => print_help(),
            Directive::Room { path } => {
                if path.is_empty() {
                    eprintln!("usage: /room <path>");
                    continue;
                }
                match engine.load_room(Path::new(&path)) {
                    Ok(()) => println!("Loaded room photo {path}"),
                    Err(err) => eprintln!("{err:#}"),
                }
            }
            Directive::Style { text } => {
                if text.is_empty() {
                    eprintln!("usage: /style <text>");
                    continue;
                }
                engine.set_style(&text);
                println!("Style set to '{text}'. Run /redesign to apply it.");
            }
            Directive::Redesign => {
                let Some(style) = engine.session().style().map(str::to_string) else {
                    eprintln!("set a style first with /style <text>");
                    continue;
                };
                match engine.redesign(&style) {
                    Ok(outcome) => print_outcome(&outcome),
                    Err(err) => eprintln!("redesign failed: {err:#}"),
                }
            }
            Directive::Products { label } => {
                if label.is_empty() {
                    eprintln!("usage: /products <label>");
                    continue;
                }
                for product in &resolve_soft(&resolver, &label) {
                    println!("{}", product_line(product));
                }
            }
            Directive::Unknown { command } => {
                eprintln!("unknown command /{command}; try /help");
            }
            Directive::Say { message } => {
                let reply = match assistant.reply(engine.session().chat(), &message) {
                    Ok(reply) => reply,
                    Err(err) => format!("⚠ Error contacting assistant: {err}"),
                };
                engine.session_mut().chat_mut().push_user(&message);
                engine.session_mut().chat_mut().push_assistant(&reply);
                let mut payload = EventPayload::new();
                payload.insert("chars".to_string(), Value::from(reply.len() as u64));
                let _ = engine.emit_event("assistant_reply", payload);
                println!("assistant> {reply}");
            }
        }
    }
    Ok(0)
}

fn require_secrets(keys: &[&'static str]) -> Result<()> {
    for key in keys {
        require_secret(key)?;
    }
    Ok(())
}

fn require_generation_credentials(generator: &str) -> Result<()> {
    if generator == "hosted-sd" && !HostedDiffusionGenerator::credentials_available() {
        return Err(ConfigError::MissingSecret("HF_API_TOKEN").into());
    }
    Ok(())
}

fn resolve_soft(resolver: &ProductResolver, label: &str) -> Vec<Product> {
    match resolver.resolve(label) {
        Ok(products) => products,
        Err(err) => {
            eprintln!("{err}");
            placeholder_products()
        }
    }
}

fn print_outcome(outcome: &RedesignOutcome) {
    if outcome.cached {
        println!("Reused the cached redesign for this style.");
    } else if let Some(seed) = outcome.seed {
        println!("Generated a fresh redesign (seed {seed}).");
    }
    println!("Prompt metadata: {}", outcome.prompt.metadata_line());
    if outcome.new_items.is_empty() {
        println!("No new relevant items detected.");
    } else {
        println!("Newly added items: {}", outcome.new_items.join(", "));
        for recommendation in &outcome.recommendations {
            for product in &recommendation.products {
                println!("- {} → {}", recommendation.label, product_line(product));
            }
        }
    }
    println!("Saved redesigned room to {}", outcome.output_path.display());
}

fn print_help() {
    println!("Commands:");
    for (command, description) in CHAT_HELP {
        println!("  {command:<20} {description}");
    }
    println!("Anything else is sent to the design assistant.");
}

fn product_line(product: &Product) -> String {
    format!("{} ({})", product.name, product.url)
}

fn default_events_path(out: &Path, events: Option<PathBuf>) -> PathBuf {
    events.unwrap_or_else(|| out.join("events.jsonl"))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use restyle_contracts::products::Product;

    use super::{default_events_path, product_line};

    #[test]
    fn events_path_defaults_into_out_dir() {
        let path = default_events_path(Path::new("/tmp/run"), None);
        assert_eq!(path, PathBuf::from("/tmp/run/events.jsonl"));

        let explicit = default_events_path(Path::new("/tmp/run"), Some(PathBuf::from("/tmp/e.jsonl")));
        assert_eq!(explicit, PathBuf::from("/tmp/e.jsonl"));
    }

    #[test]
    fn product_line_shows_name_and_url() {
        let product = Product::new("Rattan lamp", "https://shop.example/1");
        assert_eq!(product_line(&product), "Rattan lamp (https://shop.example/1)");
    }
}
