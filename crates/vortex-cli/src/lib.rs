//! vortex-cli — Front-end `vortex` : run, disasm.
//!
//! Le CLI consomme des chunks compilés (`.vxc`, produits par l’émetteur) :
//!
//! ```text
//! vortex run programme.vxc [--modules <dir>] [--trace] [--step-limit N]
//! vortex disasm programme.vxc [--title <t>]
//! ```
//!
//! `run` charge, vérifie (magic/version/hash) et exécute le chunk de tête ;
//! le résultat est affiché quand il n’est pas `none`. Une erreur du langage
//! non rattrapée sort en code 1 avec son traceback.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use vortex_core::bytecode::{disasm, read_chunk_file};
use vortex_vm::{Vm, VmError, VmOptions};

/// Interpréteur du bytecode Vortex.
#[derive(Debug, Parser)]
#[command(name = "vortex", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Exécute un chunk compilé.
    Run {
        /// Fichier `.vxc` à exécuter.
        file: Utf8PathBuf,
        /// Racine de résolution des imports.
        #[arg(short = 'm', long = "modules")]
        modules: Option<Utf8PathBuf>,
        /// Trace chaque opcode (via `log`, niveau trace).
        #[arg(long)]
        trace: bool,
        /// Limite d'instructions (garde-fou anti-boucle infinie).
        #[arg(long = "step-limit")]
        step_limit: Option<u64>,
    },
    /// Désassemble un chunk compilé.
    Disasm {
        /// Fichier `.vxc` à lister.
        file: Utf8PathBuf,
        /// Titre de l'en-tête du listing.
        #[arg(long)]
        title: Option<String>,
    },
}

/// Cœur du CLI, appelé par `main.rs`.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { file, modules, trace, step_limit } => cmd_run(&file, modules, trace, step_limit),
        Command::Disasm { file, title } => cmd_disasm(&file, title),
    }
}

fn cmd_run(
    file: &Utf8PathBuf,
    modules: Option<Utf8PathBuf>,
    trace: bool,
    step_limit: Option<u64>,
) -> Result<()> {
    let mut chunk = read_chunk_file(file.as_std_path())
        .with_context(|| format!("chargement de {file}"))?;
    if chunk.import_path.is_empty() {
        chunk.import_path = file.to_string();
    }
    log::debug!("chunk chargé: {} octets de code", chunk.code.len());

    let mut options =
        VmOptions::default().with_stdlib(true).with_trace(trace).with_step_limit(step_limit);
    if let Some(root) = modules {
        options = options.with_modules_root(root.as_std_path());
    }

    let mut vm = Vm::with_options(options);
    match vm.run_chunk(chunk) {
        Ok(result) => {
            if !result.is_none() {
                println!("{result}");
            }
            Ok(())
        }
        Err(VmError::Uncaught(u)) => {
            // Traceback déjà mis en forme par UncaughtError.
            anyhow::bail!("{u}")
        }
        Err(e) => Err(e).with_context(|| format!("exécution de {file}")),
    }
}

fn cmd_disasm(file: &Utf8PathBuf, title: Option<String>) -> Result<()> {
    let chunk = read_chunk_file(file.as_std_path())
        .with_context(|| format!("chargement de {file}"))?;
    let title = title.unwrap_or_else(|| file.to_string());
    print!("{}", disasm::disassemble(&chunk, &title));
    Ok(())
}

/* ------------------------------- Tests ------------------------------- */
#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_options() {
        let cli = Cli::try_parse_from([
            "vortex",
            "run",
            "demo.vxc",
            "--modules",
            "mods",
            "--trace",
            "--step-limit",
            "1000",
        ])
        .expect("parse ok");
        match cli.command {
            Command::Run { file, modules, trace, step_limit } => {
                assert_eq!(file, Utf8PathBuf::from("demo.vxc"));
                assert_eq!(modules, Some(Utf8PathBuf::from("mods")));
                assert!(trace);
                assert_eq!(step_limit, Some(1000));
            }
            _ => panic!("sous-commande inattendue"),
        }
    }
}
