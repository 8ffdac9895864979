//! Typed parameters for each registered job type.
//!
//! Panels send loosely-typed JSON objects. [`JobParams::parse`] validates them
//! once, up front, so argument building below never looks up a key by name.

use serde_json::Value;

use crate::error::ResolveError;
use crate::job::{JobType, Params};

#[derive(Debug, Clone, PartialEq)]
pub struct HashManifestParams {
    pub root: String,
    pub output: String,
    pub algo: String,
    pub progress: bool,
    pub ignore_hidden: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyFixityParams {
    pub root: String,
    pub manifest: String,
    pub report_extras: bool,
    pub progress: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildBagParams {
    pub src: String,
    pub dst: String,
    pub algo: String,
    pub mode: String,
    pub pattern: String,
    pub include_hidden: bool,
    pub follow_symlinks: bool,
    pub tagmanifest: bool,
    pub organization: Option<String>,
    pub source_organization: Option<String>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub description: Option<String>,
    pub profile: Option<String>,
    /// `KEY=VALUE` pairs fed to the bag-info profile templates.
    pub profile_params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildSipParams {
    pub source: String,
    pub output: String,
    pub sip_id: String,
    pub zip: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatIdentifyParams {
    pub root: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicateParams {
    pub source: String,
    pub destinations: Vec<String>,
    pub verify_hash: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PremisEventParams {
    pub log_file: String,
    pub event_type: String,
    pub object_id: String,
    pub detail: String,
    pub outcome: String,
    /// Falls back to the configured agent name when absent.
    pub agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateFinderParams {
    Inventory {
        root: String,
        inventory: String,
        show_progress: bool,
    },
    Duplicates {
        inventory: String,
        duplicates: String,
    },
    DecisionTemplate {
        duplicates: String,
        decisions: String,
    },
    TreatmentScript {
        decisions: String,
        script: String,
        system: String,
        action: String,
        quarantine_prefix: String,
        script_log_name: Option<String>,
    },
    DuplicatesDashboard {
        inventory: String,
        duplicates: String,
        csv: String,
        xlsx: Option<String>,
    },
    DecisionsDashboard {
        inventory: String,
        decisions: String,
        csv: String,
        xlsx: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobParams {
    HashManifest(HashManifestParams),
    VerifyFixity(VerifyFixityParams),
    BuildBag(BuildBagParams),
    BuildSip(BuildSipParams),
    FormatIdentify(FormatIdentifyParams),
    Replicate(ReplicateParams),
    PremisEvent(PremisEventParams),
    DuplicateFinder(DuplicateFinderParams),
}

impl JobParams {
    pub fn parse(job_type: JobType, params: &Params) -> Result<Self, ResolveError> {
        let mut r = Reader::new(job_type, params);

        let parsed = match job_type {
            JobType::HashManifest => Self::HashManifest(HashManifestParams {
                root: r.required(&["raiz"]),
                output: r.required(&["saida"]),
                algo: r.string_or(&["algo"], "sha256"),
                progress: r.flag("progress"),
                ignore_hidden: r.flag("ignore_hidden"),
            }),
            JobType::VerifyFixity => Self::VerifyFixity(VerifyFixityParams {
                root: r.required(&["raiz"]),
                manifest: r.required(&["manifesto"]),
                report_extras: r.flag("report_extras"),
                progress: r.flag("progress"),
            }),
            JobType::BuildBag => Self::BuildBag(BuildBagParams {
                src: r.required(&["src", "fonte"]),
                dst: r.required(&["dst", "destino"]),
                algo: r.string_or(&["algo"], "sha256"),
                mode: r.string_or(&["mode"], "copy"),
                pattern: r.string_or(&["pattern"], "*"),
                include_hidden: r.flag("include_hidden"),
                follow_symlinks: r.flag("follow_symlinks"),
                tagmanifest: r.flag("tagmanifest"),
                organization: r.optional(&["organization", "org"]),
                source_organization: r.optional(&["source_organization"]),
                contact_name: r.optional(&["contact_name"]),
                contact_email: r.optional(&["contact_email"]),
                description: r.optional(&["external_description"]),
                profile: r.optional(&["profile"]),
                profile_params: r.lenient_list("profile_param"),
            }),
            JobType::BuildSip => Self::BuildSip(BuildSipParams {
                source: r.required(&["fonte"]),
                output: r.required(&["saida"]),
                sip_id: r.required(&["sip_id"]),
                zip: r.flag("zip_out"),
            }),
            JobType::FormatIdentify => Self::FormatIdentify(FormatIdentifyParams {
                root: r.required(&["raiz"]),
                output: r.required(&["saida"]),
            }),
            JobType::Replicate => Self::Replicate(ReplicateParams {
                source: r.required(&["fonte"]),
                destinations: r.required_list("destinos"),
                verify_hash: r.flag("verificar_hash"),
            }),
            JobType::PremisEvent => Self::PremisEvent(PremisEventParams {
                log_file: r.required(&["arquivo_log"]),
                event_type: r.required(&["tipo"]),
                object_id: r.required(&["obj_id"]),
                detail: r.string_or(&["detalhe"], ""),
                outcome: r.string_or(&["resultado"], "success"),
                agent: r.optional(&["agente"]),
            }),
            JobType::DuplicateFinder => Self::DuplicateFinder(parse_duplicate_finder(&mut r)),
        };

        r.finish()?;
        Ok(parsed)
    }
}

fn parse_duplicate_finder(r: &mut Reader<'_>) -> DuplicateFinderParams {
    let mode = r.required(&["modo"]);
    match mode.as_str() {
        "inventario" => DuplicateFinderParams::Inventory {
            root: r.required(&["raiz"]),
            inventory: r.required(&["inventario"]),
            show_progress: r.flag("mostrar_progresso"),
        },
        "duplicatas" => DuplicateFinderParams::Duplicates {
            inventory: r.required(&["inventario"]),
            duplicates: r.required(&["duplicatas"]),
        },
        "modelo_decisoes" => DuplicateFinderParams::DecisionTemplate {
            duplicates: r.required(&["duplicatas"]),
            decisions: r.required(&["decisoes"]),
        },
        "script_tratamento" => DuplicateFinderParams::TreatmentScript {
            decisions: r.required(&["decisoes"]),
            script: r.required(&["gerar_script_remocao"]),
            system: r.string_or(&["sistema"], "linux"),
            action: r.string_or(&["acao"], "quarentena"),
            quarantine_prefix: r.string_or(&["prefixo_quarentena"], "quarentena"),
            script_log_name: r.optional(&["script_log_nome"]),
        },
        "dashboard_duplicatas" => DuplicateFinderParams::DuplicatesDashboard {
            inventory: r.required(&["inventario"]),
            duplicates: r.required(&["duplicatas"]),
            csv: r.required(&["dashboard_duplicatas_csv"]),
            xlsx: r.optional(&["dashboard_duplicatas_xlsx"]),
        },
        "dashboard_decisoes" => DuplicateFinderParams::DecisionsDashboard {
            inventory: r.required(&["inventario"]),
            decisions: r.required(&["decisoes"]),
            csv: r.required(&["dashboard_decisoes_csv"]),
            xlsx: r.optional(&["dashboard_decisoes_xlsx"]),
        },
        // An empty mode was already recorded as missing.
        "" => DuplicateFinderParams::Duplicates {
            inventory: String::new(),
            duplicates: String::new(),
        },
        other => {
            r.invalid("modo", format!("unknown mode '{other}'"));
            DuplicateFinderParams::Duplicates {
                inventory: String::new(),
                duplicates: String::new(),
            }
        }
    }
}

/// Collects every problem with a parameter object before failing, so one
/// error names all missing fields at once.
struct Reader<'a> {
    job_type: JobType,
    params: &'a Params,
    missing: Vec<String>,
    invalid: Option<(String, String)>,
}

impl<'a> Reader<'a> {
    fn new(job_type: JobType, params: &'a Params) -> Self {
        Self {
            job_type,
            params,
            missing: Vec::new(),
            invalid: None,
        }
    }

    /// First present, non-empty value among `keys` (aliases in priority order).
    fn lookup(&mut self, keys: &[&str]) -> Lookup {
        let params = self.params;
        for key in keys {
            match params.get(*key) {
                None | Some(Value::Null) => continue,
                Some(value) => match scalar_to_string(value) {
                    Some(s) if s.is_empty() => continue,
                    Some(s) => return Lookup::Found(s),
                    None => {
                        self.invalid(key, "expected a string".into());
                        return Lookup::Invalid;
                    }
                },
            }
        }
        Lookup::Absent
    }

    fn required(&mut self, keys: &[&str]) -> String {
        match self.lookup(keys) {
            Lookup::Found(value) => value,
            Lookup::Invalid => String::new(),
            Lookup::Absent => {
                let name = keys.join("/");
                if !self.missing.contains(&name) {
                    self.missing.push(name);
                }
                String::new()
            }
        }
    }

    fn optional(&mut self, keys: &[&str]) -> Option<String> {
        match self.lookup(keys) {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }

    fn string_or(&mut self, keys: &[&str], default: &str) -> String {
        self.optional(keys).unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, key: &str) -> bool {
        self.params.get(key).is_some_and(truthy)
    }

    fn list(&mut self, key: &str) -> Vec<String> {
        let params = self.params;
        match params.get(key) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match scalar_to_string(item) {
                        Some(s) if !s.is_empty() => out.push(s),
                        Some(_) => {}
                        None => self.invalid(key, "expected a list of strings".into()),
                    }
                }
                out
            }
            Some(_) => {
                self.invalid(key, "expected a list".into());
                Vec::new()
            }
        }
    }

    fn required_list(&mut self, key: &str) -> Vec<String> {
        let items = self.list(key);
        if items.is_empty() && self.invalid.as_ref().is_none_or(|(field, _)| field != key) {
            self.missing.push(key.to_string());
        }
        items
    }

    /// Like [`Reader::list`] but silently drops anything that is not a
    /// non-empty string.
    fn lenient_list(&self, key: &str) -> Vec<String> {
        match self.params.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn invalid(&mut self, field: &str, reason: String) {
        if self.invalid.is_none() {
            self.invalid = Some((field.to_string(), reason));
        }
    }

    fn finish(self) -> Result<(), ResolveError> {
        if !self.missing.is_empty() {
            return Err(ResolveError::MissingParams {
                job_type: self.job_type.id().to_string(),
                fields: self.missing,
            });
        }
        if let Some((field, reason)) = self.invalid {
            return Err(ResolveError::InvalidParam {
                job_type: self.job_type.id().to_string(),
                field,
                reason,
            });
        }
        Ok(())
    }
}

enum Lookup {
    Found(String),
    Absent,
    Invalid,
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// JSON truthiness: false, 0, "", [], {} and null are false.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn hash_manifest_applies_defaults() {
        let parsed = JobParams::parse(
            JobType::HashManifest,
            &params(json!({"raiz": "/data", "saida": "/out/manifest.txt", "progress": 1})),
        )
        .unwrap();

        assert_eq!(
            parsed,
            JobParams::HashManifest(HashManifestParams {
                root: "/data".into(),
                output: "/out/manifest.txt".into(),
                algo: "sha256".into(),
                progress: true,
                ignore_hidden: false,
            })
        );
    }

    #[test]
    fn all_missing_fields_are_reported() {
        let err = JobParams::parse(JobType::BuildSip, &params(json!({"saida": ""}))).unwrap_err();
        assert_eq!(
            err,
            ResolveError::MissingParams {
                job_type: "BUILD_SIP".into(),
                fields: vec!["fonte".into(), "saida".into(), "sip_id".into()],
            }
        );
        assert!(err.to_string().contains("BUILD_SIP"));
        assert!(err.to_string().contains("sip_id"));
    }

    #[test]
    fn build_bag_accepts_legacy_keys() {
        let parsed = JobParams::parse(
            JobType::BuildBag,
            &params(json!({
                "fonte": "/src",
                "destino": "/bags/b1",
                "org": "APESP",
                "profile_param": ["transfer_id=T-1", "", 7]
            })),
        )
        .unwrap();

        let JobParams::BuildBag(bag) = parsed else {
            panic!("expected BuildBag, got {parsed:?}");
        };
        assert_eq!(bag.src, "/src");
        assert_eq!(bag.dst, "/bags/b1");
        assert_eq!(bag.organization.as_deref(), Some("APESP"));
        assert_eq!(bag.profile_params, vec!["transfer_id=T-1".to_string()]);
        assert_eq!(bag.mode, "copy");
    }

    #[test]
    fn new_keys_win_over_aliases() {
        let parsed = JobParams::parse(
            JobType::BuildBag,
            &params(json!({"src": "/new", "fonte": "/old", "dst": "/d"})),
        )
        .unwrap();
        assert!(matches!(parsed, JobParams::BuildBag(b) if b.src == "/new"));
    }

    #[test]
    fn replicate_requires_destinations() {
        let err = JobParams::parse(
            JobType::Replicate,
            &params(json!({"fonte": "/src", "destinos": []})),
        )
        .unwrap_err();
        assert!(
            matches!(err, ResolveError::MissingParams { fields, .. } if fields == vec!["destinos"])
        );
    }

    #[test]
    fn wrong_value_types_are_invalid() {
        let err = JobParams::parse(
            JobType::FormatIdentify,
            &params(json!({"raiz": {"nested": true}, "saida": "out.jsonl"})),
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidParam { field, .. } if field == "raiz"));
    }

    #[test]
    fn duplicate_finder_dispatches_on_mode() {
        let parsed = JobParams::parse(
            JobType::DuplicateFinder,
            &params(json!({
                "modo": "script_tratamento",
                "decisoes": "decisoes.csv",
                "gerar_script_remocao": "tratar.sh"
            })),
        )
        .unwrap();

        assert_eq!(
            parsed,
            JobParams::DuplicateFinder(DuplicateFinderParams::TreatmentScript {
                decisions: "decisoes.csv".into(),
                script: "tratar.sh".into(),
                system: "linux".into(),
                action: "quarentena".into(),
                quarantine_prefix: "quarentena".into(),
                script_log_name: None,
            })
        );

        let err = JobParams::parse(JobType::DuplicateFinder, &params(json!({"modo": "tudo"})))
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidParam { field, .. } if field == "modo"));
    }
}
