//! The `tutorloop init` command.

use anyhow::Result;

pub fn execute() -> Result<()> {
    if std::path::Path::new("tutorloop.toml").exists() {
        println!("tutorloop.toml already exists, skipping.");
    } else {
        std::fs::write("tutorloop.toml", SAMPLE_CONFIG)?;
        println!("Created tutorloop.toml");
    }

    std::fs::create_dir_all("problem-banks")?;
    let bank_path = std::path::Path::new("problem-banks/intro.toml");
    if bank_path.exists() {
        println!("problem-banks/intro.toml already exists, skipping.");
    } else {
        std::fs::write(bank_path, EXAMPLE_BANK)?;
        println!("Created problem-banks/intro.toml");
    }

    println!("\nNext steps:");
    println!("  1. Start Ollama and pull the models named in tutorloop.toml");
    println!("  2. Run: tutorloop validate && tutorloop seed");
    println!("  3. Run: tutorloop register --name Ada --email ada@example.com");
    println!(
        "  4. Run: tutorloop submit --student ada@example.com --problem double-it --code main.py"
    );

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# tutorloop configuration

database = "tutorloop.db"
problem_bank = "problem-banks"

[ollama]
base_url = "http://localhost:11434"

[feedback]
model = "qwen2.5-coder:1.5b-instruct"
max_tokens = 200
temperature = 0.3
timeout_ms = 3000

[deep]
model = "qwen2.5-coder:7b-instruct"
max_tokens = 1500
temperature = 0.4
timeout_ms = 30000

[pipeline.sandbox]
python = "python3"
case_timeout_ms = 5000
suite_timeout_ms = 30000
memory_limit_mb = 256

[pipeline.concurrency]
max_concurrent_sandboxes = 4
"#;

const EXAMPLE_BANK: &str = include_str!("../../../../problem-banks/intro.toml");
