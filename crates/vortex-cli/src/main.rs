//! vortex-cli/src/main.rs
//!
//! Point d’entrée du binaire `vortex`.
//! Ici, on se contente de préparer l’environnement (logs, rapports
//! d’erreurs) puis on délègue toute la logique à `vortex_cli::run()`.
//!
//! Avantages :
//! - `lib.rs` peut être testé en unité (cargo test -p vortex-cli)
//! - main.rs reste minimal, juste pour le setup global

fn main() {
    // Rapports d’erreurs stylés
    if let Err(e) = color_eyre::install() {
        eprintln!("⚠️ Impossible d'initialiser color-eyre: {e}");
    }

    // Logs si RUST_LOG est défini
    env_logger::init();

    if let Err(err) = vortex_cli::run() {
        eprintln!("❌ Erreur: {err:#}");
        std::process::exit(1);
    }
}
