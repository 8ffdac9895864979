//! Maps a job type and its parameters to the script invocation that runs it.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::process::{Command, Stdio};

use crate::config::Config;
use crate::error::ResolveError;
use crate::job::{JobType, Params};
use crate::params::{BuildBagParams, DuplicateFinderParams, JobParams, PremisEventParams};

/// Program plus argument vector. Arguments are kept as separate elements so
/// no shell ever interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl CommandLine {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Arguments after the script path.
    pub fn script_args(&self) -> &[OsString] {
        self.args.get(1..).unwrap_or_default()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

pub fn resolve(
    job_type: &str,
    params: &Params,
    config: &Config,
) -> Result<CommandLine, ResolveError> {
    let kind = JobType::parse(job_type)
        .ok_or_else(|| ResolveError::UnsupportedJobType(job_type.to_string()))?;
    let parsed = JobParams::parse(kind, params)?;

    let mut args = Args::default();
    args.push(config.scripts_dir.join(kind.script()));
    build_args(&parsed, config, &mut args);

    Ok(CommandLine {
        program: config.interpreter.clone().into(),
        args: args.0,
    })
}

#[derive(Default)]
struct Args(Vec<OsString>);

impl Args {
    fn push(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.0.push(arg.as_ref().to_owned());
        self
    }

    fn opt(&mut self, flag: &str, value: impl AsRef<OsStr>) -> &mut Self {
        self.push(flag).push(value)
    }

    fn opt_some(&mut self, flag: &str, value: Option<&String>) -> &mut Self {
        if let Some(value) = value {
            self.opt(flag, value);
        }
        self
    }

    fn switch(&mut self, flag: &str, on: bool) -> &mut Self {
        if on {
            self.push(flag);
        }
        self
    }
}

fn build_args(params: &JobParams, config: &Config, a: &mut Args) {
    match params {
        JobParams::HashManifest(p) => {
            a.opt("--raiz", &p.root)
                .opt("--saida", &p.output)
                .opt("--algo", &p.algo)
                .switch("--progress", p.progress)
                .switch("--ignore-hidden", p.ignore_hidden);
        }
        JobParams::VerifyFixity(p) => {
            a.opt("--raiz", &p.root)
                .opt("--manifesto", &p.manifest)
                .switch("--report-extras", p.report_extras)
                .switch("--progress", p.progress);
        }
        JobParams::BuildBag(p) => build_bag_args(p, a),
        JobParams::BuildSip(p) => {
            a.opt("--fonte", &p.source)
                .opt("--saida", &p.output)
                .opt("--sip-id", &p.sip_id)
                .switch("--zip", p.zip);
        }
        JobParams::FormatIdentify(p) => {
            a.opt("--raiz", &p.root).opt("--saida", &p.output);
        }
        JobParams::Replicate(p) => {
            a.opt("--fonte", &p.source);
            for dest in &p.destinations {
                a.opt("--destino", dest);
            }
            a.switch("--verificar-hash", p.verify_hash);
        }
        JobParams::PremisEvent(p) => premis_event_args(p, config, a),
        JobParams::DuplicateFinder(p) => duplicate_finder_args(p, a),
    }
}

fn build_bag_args(p: &BuildBagParams, a: &mut Args) {
    a.push(&p.src)
        .push(&p.dst)
        .opt("--algo", &p.algo)
        .opt("--mode", &p.mode)
        .opt("--pattern", &p.pattern)
        .switch("--include-hidden", p.include_hidden)
        .switch("--follow-symlinks", p.follow_symlinks)
        .switch("--tagmanifest", p.tagmanifest)
        .opt_some("--organization", p.organization.as_ref())
        .opt_some("--source-organization", p.source_organization.as_ref())
        .opt_some("--contact-name", p.contact_name.as_ref())
        .opt_some("--contact-email", p.contact_email.as_ref())
        .opt_some("--description", p.description.as_ref())
        .opt_some("--profile", p.profile.as_ref());
    for kv in &p.profile_params {
        a.opt("--profile-param", kv);
    }
}

fn premis_event_args(p: &PremisEventParams, config: &Config, a: &mut Args) {
    let agent = p.agent.as_deref().unwrap_or(&config.premis_agent);
    a.opt("--arquivo-log", &p.log_file)
        .opt("--tipo", &p.event_type)
        .opt("--obj-id", &p.object_id)
        .opt("--detalhe", &p.detail)
        .opt("--resultado", &p.outcome)
        .opt("--agente", agent);
}

fn duplicate_finder_args(p: &DuplicateFinderParams, a: &mut Args) {
    match p {
        DuplicateFinderParams::Inventory {
            root,
            inventory,
            show_progress,
        } => {
            a.opt("--raiz", root)
                .opt("--inventario", inventory)
                .switch("--mostrar-progresso", *show_progress);
        }
        DuplicateFinderParams::Duplicates {
            inventory,
            duplicates,
        } => {
            a.opt("--inventario", inventory)
                .opt("--duplicatas", duplicates);
        }
        DuplicateFinderParams::DecisionTemplate {
            duplicates,
            decisions,
        } => {
            a.opt("--from-duplicatas", duplicates)
                .opt("--decisoes", decisions);
        }
        DuplicateFinderParams::TreatmentScript {
            decisions,
            script,
            system,
            action,
            quarantine_prefix,
            script_log_name,
        } => {
            a.opt("--decisoes", decisions)
                .opt("--gerar-script-remocao", script)
                .opt("--sistema", system)
                .opt("--acao", action)
                .opt("--prefixo-quarentena", quarantine_prefix)
                .opt_some("--script-log-nome", script_log_name.as_ref());
        }
        DuplicateFinderParams::DuplicatesDashboard {
            inventory,
            duplicates,
            csv,
            xlsx,
        } => {
            a.opt("--inventario", inventory)
                .opt("--duplicatas", duplicates)
                .opt("--dashboard-duplicatas-csv", csv)
                .opt_some("--dashboard-duplicatas-xlsx", xlsx.as_ref());
        }
        DuplicateFinderParams::DecisionsDashboard {
            inventory,
            decisions,
            csv,
            xlsx,
        } => {
            a.opt("--inventario", inventory)
                .opt("--decisoes", decisions)
                .opt("--dashboard-decisoes-csv", csv)
                .opt_some("--dashboard-decisoes-xlsx", xlsx.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::path::PathBuf;

    fn config() -> Config {
        Config {
            scripts_dir: PathBuf::from("/opt/thor/scripts"),
            ..Config::default()
        }
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    fn script_args(cmd: &CommandLine) -> Vec<String> {
        cmd.script_args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn hash_manifest_command_line() {
        let cmd = resolve(
            "HASH_MANIFEST",
            &params(json!({"raiz": "/data", "saida": "/out/m.txt", "progress": true})),
            &config(),
        )
        .unwrap();

        assert_eq!(cmd.program, OsString::from("python3"));
        assert_eq!(
            cmd.args[0],
            PathBuf::from("/opt/thor/scripts/hash_files.py").into_os_string()
        );
        assert_eq!(
            script_args(&cmd),
            ["--raiz", "/data", "--saida", "/out/m.txt", "--algo", "sha256", "--progress"]
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = resolve("BOGUS_TYPE", &Params::new(), &config()).unwrap_err();
        assert_eq!(err, ResolveError::UnsupportedJobType("BOGUS_TYPE".into()));
        assert!(err.to_string().contains("BOGUS_TYPE"));
    }

    #[test]
    fn missing_params_name_the_job_type() {
        let err =
            resolve("VERIFY_FIXITY", &params(json!({"raiz": "/data"})), &config()).unwrap_err();
        assert!(err.to_string().starts_with("VERIFY_FIXITY"));
        assert!(err.to_string().contains("manifesto"));
    }

    #[test]
    fn build_bag_positionals_and_metadata() {
        let cmd = resolve(
            "BUILD_BAG",
            &params(json!({
                "src": "/src dir",
                "dst": "/bags/b1",
                "mode": "link",
                "tagmanifest": true,
                "external_description": "Fundo X",
                "profile": "apesp",
                "profile_param": ["a=1", "b=2"]
            })),
            &config(),
        )
        .unwrap();

        assert_eq!(
            script_args(&cmd),
            [
                "/src dir", "/bags/b1", "--algo", "sha256", "--mode", "link", "--pattern", "*",
                "--tagmanifest", "--description", "Fundo X", "--profile", "apesp",
                "--profile-param", "a=1", "--profile-param", "b=2",
            ]
        );
    }

    #[test]
    fn replicate_repeats_destination_flag() {
        let cmd = resolve(
            "REPLICATE",
            &params(json!({"fonte": "/a", "destinos": ["/b", "/c"], "verificar_hash": true})),
            &config(),
        )
        .unwrap();
        assert_eq!(
            script_args(&cmd),
            ["--fonte", "/a", "--destino", "/b", "--destino", "/c", "--verificar-hash"]
        );
    }

    #[test]
    fn premis_event_uses_configured_agent() {
        let cmd = resolve(
            "PREMIS_EVENT",
            &params(json!({"arquivo_log": "/logs/p.jsonl", "tipo": "ingest", "obj_id": "obj-1"})),
            &config(),
        )
        .unwrap();
        let args = script_args(&cmd);
        assert_eq!(
            &args[args.len() - 6..],
            [
                "--detalhe",
                "",
                "--resultado",
                "success",
                "--agente",
                crate::config::DEFAULT_PREMIS_AGENT
            ]
        );
    }

    #[test]
    fn decision_template_reads_from_duplicates() {
        let cmd = resolve(
            "DUPLICATE_FINDER",
            &params(json!({"modo": "modelo_decisoes", "duplicatas": "d.csv", "decisoes": "x.csv"})),
            &config(),
        )
        .unwrap();
        assert_eq!(
            script_args(&cmd),
            ["--from-duplicatas", "d.csv", "--decisoes", "x.csv"]
        );
        assert!(
            cmd.to_string()
                .ends_with("duplicate_finder.py --from-duplicatas d.csv --decisoes x.csv")
        );
    }
}
