//! Example: a small AWS footprint managed with skyform.
//!
//! Declares a customer managed IAM policy, a role the policy is attached
//! to and a regional web ACL, plus a DNS validated certificate when a
//! domain is given. Run with `RUST_LOG=info` to see what skyform does
//! under the hood.
//!
//! ```sh
//! cargo run -p skyform-example -- plan
//! cargo run -p skyform-example -- --domain example.com apply
//! cargo run -p skyform-example -- --refresh apply
//! cargo run -p skyform-example -- destroy --force
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use sky::{
    aws::{self, acm, iam, wafv2, AwsProvider, ProviderConfig, Tags},
    Action, Plan, Store,
};

#[derive(Parser)]
#[command(name = "infra", about = "Manage a small AWS footprint")]
struct Cli {
    /// Directory for skyform store files.
    #[arg(long, env = "SKYFORM_STATE_DIR", default_value = "state")]
    state_dir: PathBuf,

    /// Provider config TOML file.
    #[arg(long, env = "SKYFORM_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the region of the provider config.
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Overrides the profile of the provider config.
    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// Read unchanged resources back from AWS and reconcile drift.
    #[arg(long, default_value = "false")]
    refresh: bool,

    /// Prefix of every resource name.
    #[arg(long, default_value = "skyform-demo")]
    prefix: String,

    /// Request a certificate for this domain.
    #[arg(long)]
    domain: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what would change without applying.
    Plan,
    /// Plan and apply infrastructure changes.
    Apply,
    /// Tear down all infrastructure.
    Destroy {
        #[clap(long, short, default_value = "false")]
        force: bool,
    },
}

fn declare_infra(
    store: &mut Store<AwsProvider>,
    prefix: &str,
    domain: Option<&str>,
) -> Result<(), sky::Error> {
    let tags = Tags::new().with("app", prefix);

    let policy = store.resource(
        "read-logs-policy",
        iam::Policy {
            name: format!("{prefix}-read-logs"),
            path: None,
            description: None,
            document: serde_json::json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Action": ["logs:GetLogEvents", "logs:FilterLogEvents"],
                    "Resource": "*"
                }]
            }),
            tags: tags.clone(),
        },
    )?;

    let _role = store.resource(
        "worker-role",
        iam::Role {
            name: format!("{prefix}-worker"),
            path: None,
            assume_role_policy: serde_json::json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": {"Service": "ec2.amazonaws.com"},
                    "Action": "sts:AssumeRole"
                }]
            }),
            description: Some("Runs the log workers".to_owned()),
            max_session_duration: None,
            attached_policy_arns: vec![
                iam::PolicyArn::aws("CloudWatchAgentServerPolicy"),
                policy.remote(|p| p.arn.clone()).into(),
            ],
            tags: tags.clone(),
        },
    )?;

    let metric = |name: &str| wafv2::VisibilityConfig::new(format!("{prefix}-{name}"));
    let _acl = store.resource(
        "web-acl",
        wafv2::WebAcl {
            name: format!("{prefix}-web"),
            scope: wafv2::Scope::Regional,
            description: Some("Front door rules".to_owned()),
            default_action: wafv2::DefaultAction::Allow,
            rules: vec![
                wafv2::Rule {
                    name: "common".to_owned(),
                    priority: 0,
                    action: None,
                    override_action: Some(wafv2::OverrideAction::None),
                    statement: wafv2::Statement::ManagedRuleGroup {
                        vendor_name: "AWS".to_owned(),
                        name: "AWSManagedRulesCommonRuleSet".to_owned(),
                        version: None,
                        excluded_rules: vec!["SizeRestrictions_BODY".to_owned()],
                    },
                    visibility_config: metric("common"),
                },
                wafv2::Rule {
                    name: "rate-limit".to_owned(),
                    priority: 1,
                    action: Some(wafv2::RuleAction::Block),
                    override_action: None,
                    statement: wafv2::Statement::RateBased { limit: 2000 },
                    visibility_config: metric("rate-limit"),
                },
            ],
            visibility_config: metric("web"),
            tags: tags.clone(),
        },
    )?;

    if let Some(domain) = domain {
        let certificate = store.resource(
            "certificate",
            acm::Certificate {
                domain_name: domain.to_owned(),
                validation_method: acm::ValidationMethod::Dns,
                subject_alternative_names: vec![format!("*.{domain}")],
                tags,
            },
        )?;
        if certificate.action() == Action::Create {
            log::info!("add the certificate's validation records to the {domain} zone after apply");
        }
    }

    Ok(())
}

fn print_plan(plan: &Plan<AwsProvider>) {
    if plan.actions.is_empty() {
        println!("{}", "No changes.".dimmed());
    }
    for action in &plan.actions {
        let name = action.action.to_string();
        let verb = match action.action {
            Action::Create => name.as_str().green(),
            Action::Update => name.as_str().yellow(),
            Action::Destroy => name.as_str().red(),
            Action::Read | Action::Refresh => name.as_str().cyan(),
            Action::Load => name.as_str().dimmed(),
        };
        let orphan = if action.is_orphan { " (orphan)" } else { "" };
        println!(
            "  {verb} '{}' [{}]{orphan}",
            action.id,
            action.type_name.as_deref().unwrap_or("unknown").dimmed()
        );
    }
    for warning in &plan.warnings {
        println!("  {} {warning}", "WARNING:".yellow().bold());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ProviderConfig::from_path(path)?,
        None => ProviderConfig::default(),
    };
    if cli.region.is_some() {
        config.region = cli.region.clone();
    }
    if cli.profile.is_some() {
        config.profile = cli.profile.clone();
    }
    let provider = AwsProvider::from_config(&config).await;

    let mut store = Store::new(&cli.state_dir, provider).with_refresh(cli.refresh);
    aws::register_all(&mut store);

    match cli.command {
        Command::Plan => {
            declare_infra(&mut store, &cli.prefix, cli.domain.as_deref())?;
            print_plan(&store.plan()?);
        }
        Command::Apply => {
            declare_infra(&mut store, &cli.prefix, cli.domain.as_deref())?;
            let plan = store.plan()?;
            print_plan(&plan);
            if plan.has_changes() {
                println!();
                println!("Applying...");
            }
            store.apply(plan).await?;
            println!("{}", "Done.".green());
        }
        Command::Destroy { force } => {
            // Every stored resource of a registered type is an orphan once
            // nothing is declared.
            store.clear_resources();
            let plan = store.plan()?;
            print_plan(&plan);
            if force {
                println!();
                println!("Applying...");
                store.apply(plan).await?;
                println!("{}", "Done.".green());
            } else {
                println!();
                println!("Please call `destroy --force` to delete these resources.");
            }
        }
    }
    Ok(())
}
