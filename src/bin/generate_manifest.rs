use std::env;
use std::path::PathBuf;
use worldsync::network::schema;

fn main() {
    if let Err(err) = run() {
        eprintln!("[manifest] error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let output_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("schemas/schema_manifest.json"));

    if let Some(name) = schema::find_collision() {
        return Err(format!("message type {name} collides with another entry").into());
    }
    schema::write_manifest_json(&output_path)?;
    println!(
        "[manifest] wrote {} message types (fingerprint {:016x}) to {}",
        schema::MESSAGE_TYPES.len(),
        schema::schema_fingerprint(),
        output_path.display()
    );
    Ok(())
}
