use crate::errors::ReplayError;
use crate::types::ReplayRunParams;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// What a launch factory can see about the run it is building processes for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    pub fixture_key: String,
    pub filtered_fixture: PathBuf,
    pub param_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchProcess {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl LaunchProcess {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            env: Vec::new(),
            cwd: None,
        }
    }
}

/// Builds the processes under test for one parameter set. Processes are brought
/// up in the returned order and torn down in reverse.
pub trait LaunchFactory: Send + Sync {
    fn launch_description(
        &self,
        params: &ReplayRunParams,
        ctx: &LaunchContext,
    ) -> Result<Vec<LaunchProcess>, ReplayError>;
}

impl<F> LaunchFactory for F
where
    F: Fn(&ReplayRunParams, &LaunchContext) -> Result<Vec<LaunchProcess>, ReplayError>
        + Send
        + Sync,
{
    fn launch_description(
        &self,
        params: &ReplayRunParams,
        ctx: &LaunchContext,
    ) -> Result<Vec<LaunchProcess>, ReplayError> {
        self(params, ctx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessTemplate {
    pub name: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Launch description declared in a test file: command lines with `${param}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateLaunch {
    pub processes: Vec<ProcessTemplate>,
    pub cwd: PathBuf,
}

impl LaunchFactory for TemplateLaunch {
    fn launch_description(
        &self,
        params: &ReplayRunParams,
        ctx: &LaunchContext,
    ) -> Result<Vec<LaunchProcess>, ReplayError> {
        let mut vars = params
            .params
            .keys()
            .filter_map(|key| params.value_text(key).map(|value| (key.clone(), value)))
            .collect::<BTreeMap<_, _>>();
        vars.insert("param_name".to_string(), params.name.clone());
        vars.insert("fixture_key".to_string(), ctx.fixture_key.clone());
        vars.insert(
            "filtered_fixture".to_string(),
            ctx.filtered_fixture.display().to_string(),
        );

        self.processes
            .iter()
            .map(|template| -> Result<LaunchProcess, ReplayError> {
                let (program, args) = template.cmd.split_first().ok_or_else(|| {
                    ReplayError::InvalidConfig(format!("process `{}` has an empty cmd", template.name))
                })?;
                let env = template
                    .env
                    .iter()
                    .map(|(k, v)| substitute(v, &vars).map(|value| (k.clone(), value)))
                    .collect::<Result<Vec<_>, ReplayError>>()?;
                Ok(LaunchProcess {
                    name: template.name.clone(),
                    program: substitute(program, &vars)?,
                    args: args
                        .iter()
                        .map(|arg| substitute(arg, &vars))
                        .collect::<Result<Vec<_>, _>>()?,
                    env,
                    cwd: Some(self.cwd.clone()),
                })
            })
            .collect()
    }
}

/// Replaces every `${name}` in `template`. Unknown names are an error so a typo in a
/// test file never reaches a launched process as a literal placeholder.
pub fn substitute(template: &str, vars: &BTreeMap<String, String>) -> Result<String, ReplayError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            ReplayError::InvalidConfig(format!("unterminated placeholder in `{template}`"))
        })?;
        let name = &after[..end];
        let value = vars.get(name).ok_or_else(|| {
            ReplayError::InvalidConfig(format!("unknown placeholder `${{{name}}}` in `{template}`"))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> LaunchContext {
        LaunchContext {
            fixture_key: "cmd_vel_only".to_string(),
            filtered_fixture: PathBuf::from("/tmp/run/cmd_vel_only/filtered.mcap"),
            param_dir: PathBuf::from("/tmp/run/cmd_vel_only/runs/default"),
        }
    }

    #[test]
    fn substitute_replaces_known_names_and_rejects_unknown() {
        let mut vars = BTreeMap::new();
        vars.insert("x".to_string(), "1.0".to_string());
        assert_eq!(
            substitute("{linear: {x: ${x}}}", &vars).expect("subst"),
            "{linear: {x: 1.0}}"
        );
        assert_eq!(substitute("plain", &vars).expect("plain"), "plain");
        assert!(substitute("${y}", &vars).is_err());
        assert!(substitute("${x", &vars).is_err());
    }

    #[test]
    fn template_launch_fills_params_into_every_process() {
        let launch = TemplateLaunch {
            processes: vec![ProcessTemplate {
                name: "pub".to_string(),
                cmd: vec![
                    "ros2".to_string(),
                    "topic".to_string(),
                    "pub".to_string(),
                    "/user/cmd_vel".to_string(),
                    "{linear: {x: ${x}}}".to_string(),
                ],
                env: BTreeMap::from([("MODE".to_string(), "${mode}".to_string())]),
            }],
            cwd: PathBuf::from("/tests"),
        };
        let mut params = ReplayRunParams::default_set();
        params.params.insert("x".to_string(), json!(1.0));
        params.params.insert("mode".to_string(), json!("fast"));

        let processes = launch.launch_description(&params, &ctx()).expect("launch");
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].program, "ros2");
        assert_eq!(processes[0].args.last().map(String::as_str), Some("{linear: {x: 1.0}}"));
        assert_eq!(processes[0].env, vec![("MODE".to_string(), "fast".to_string())]);
        assert_eq!(processes[0].cwd, Some(PathBuf::from("/tests")));
    }

    #[test]
    fn closures_are_launch_factories() {
        let factory = |params: &ReplayRunParams,
                       _ctx: &LaunchContext|
         -> Result<Vec<LaunchProcess>, ReplayError> {
            Ok(vec![LaunchProcess::new(
                "node",
                "my_node",
                vec![format!("--param={}", params.name)],
            )])
        };
        let processes = factory
            .launch_description(&ReplayRunParams::default_set(), &ctx())
            .expect("closure");
        assert_eq!(processes[0].args, vec!["--param=default".to_string()]);
    }
}
