use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use sandgate::Config;
use sandgate::egress::evaluate_target;

use super::load_policy;

#[derive(Args)]
pub struct PolicyArgs {
    #[command(subcommand)]
    pub command: PolicyCommands,

    /// Read the policy from a file instead of the environment
    #[arg(long, global = true)]
    pub policy_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Evaluate domains or IP addresses against the policy
    Check {
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Show the IP targets that are installed as packet-filter rules
    Targets,
}

pub fn run(args: PolicyArgs, config: &Config) -> Result<()> {
    let policy = load_policy(args.policy_file.as_deref(), &config.egress.policy_env)?;

    match args.command {
        PolicyCommands::Check { targets } => {
            if policy.is_none() {
                println!("No egress policy configured; everything is allowed.");
            }
            for target in &targets {
                let decision = evaluate_target(policy.as_ref(), target);
                match decision.rule {
                    Some(index) => println!("{}\t{}\t(rule {})", decision.action, target, index),
                    None => println!("{}\t{}\t(default)", decision.action, target),
                }
            }
        }
        PolicyCommands::Targets => {
            let Some(policy) = policy else {
                println!("No egress policy configured.");
                return Ok(());
            };
            let targets = policy.classify_targets();
            println!("Egress IP targets:");
            println!("  allow v4: {:?}", targets.allow_v4);
            println!("  allow v6: {:?}", targets.allow_v6);
            println!("  deny v4:  {:?}", targets.deny_v4);
            println!("  deny v6:  {:?}", targets.deny_v6);
            println!("  default:  {}", policy.default_action());
        }
    }

    Ok(())
}
