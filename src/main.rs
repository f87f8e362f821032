use anyhow::{anyhow, bail, Context, Result};
use rustyline::{error::ReadlineError, DefaultEditor};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use query_revisor::service::{BatchItemResponse, BatchRequest, BatchSettings, EntityPage, PagingInfo};
use query_revisor::{
    parse_fetch_xml, to_fetch_xml, ConfigError, DataService, EngineSettings, FetchXml, PluginSettings, QueryRevisor,
    QueryTree, Record, RevisionDirective, ServiceError, SqlCompiler, TraceBuffer,
};

const SETTINGS_FILENAME: &str = "revisor.json";

const HELP: &str = "\
:settings <file>              load engine settings (JSON)
:target <file>                load the target query (FetchXml)
:template <file>              load the template query (FetchXml)
:revise <name> <value>        apply a directive, e.g. :revise {Append}{Criteria} {FetchXml}
:plugin <file> <key> <node>   apply the directive registered in a plugin settings file
:show                         print the target query as FetchXml
:sql                          print the target query as SQL
:trace                        print and clear the trace log
:quit";

/// 离线使用的服务替身，所有远程调用都会失败
struct Disconnected;

impl DataService for Disconnected {
    fn retrieve_multiple(&self, _query: &QueryTree, _paging: &PagingInfo) -> Result<EntityPage, ServiceError> {
        Err(ServiceError::Transport("no service connected".to_string()))
    }

    fn retrieve(&self, entity_name: &str, id: Uuid, _columns: &[String]) -> Result<Record, ServiceError> {
        Err(ServiceError::Transport(format!(
            "no service connected, cannot look up {} {}",
            entity_name, id
        )))
    }

    fn execute_batch(
        &self,
        _requests: &[BatchRequest],
        _settings: &BatchSettings,
    ) -> Result<Vec<BatchItemResponse>, ServiceError> {
        Err(ServiceError::Transport("no service connected".to_string()))
    }
}

#[derive(Default)]
struct Session {
    settings: EngineSettings,
    target: Option<QueryTree>,
    template: Option<String>,
    trace: TraceBuffer,
}

enum Flow {
    Continue,
    Quit,
}

impl Session {
    fn target(&self) -> Result<&QueryTree> {
        self.target.as_ref().ok_or_else(|| anyhow!("no target query, use :target <file>"))
    }

    fn revise(&mut self, directive: RevisionDirective) -> Result<String> {
        let query = self.target.as_mut().ok_or_else(|| anyhow!("no target query, use :target <file>"))?;
        let outcome = QueryRevisor::new(&directive).revise_query(query, &Disconnected, &mut self.trace)?;
        Ok(format!("{:?}", outcome))
    }

    fn handle_input(&mut self, line: &str) -> Result<(Flow, Option<String>)> {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return Ok((Flow::Continue, None));
        };
        let args: Vec<&str> = parts.collect();

        let output = match (command, args.as_slice()) {
            (":quit" | ":q", _) => return Ok((Flow::Quit, None)),
            (":help", _) => HELP.to_string(),
            (":settings", [path]) => {
                self.settings = EngineSettings::from_json_file(path)?;
                format!("{} table mapping(s)", self.settings.table_mappings.len())
            }
            (":target", [path]) => {
                let markup = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
                let query = parse_fetch_xml(&markup)?;
                let summary = format!("target: {} ({} join(s))", query.entity_name, query.joins.len());
                self.target = Some(query);
                summary
            }
            (":template", [path]) => {
                let markup = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
                self.template = Some(markup);
                "template loaded".to_string()
            }
            (":revise", [name, value]) => {
                let template = self.template.clone().unwrap_or_default();
                let directive = RevisionDirective::parse(name, value, &template, &FetchXml, &mut self.trace);
                self.revise(directive)?
            }
            (":plugin", [path, key, node]) => {
                let settings = PluginSettings::from_file(path)?;
                let directive = RevisionDirective::from_settings(&settings, key, node, &FetchXml, &mut self.trace);
                self.revise(directive)?
            }
            (":show", []) => to_fetch_xml(self.target()?),
            (":sql", []) => {
                let compiled = SqlCompiler::from_settings(&self.settings).compile(self.target()?)?;
                compiled.sql
            }
            (":trace", []) => {
                let text = self.trace.text().trim_end().to_string();
                self.trace.clear();
                text
            }
            _ => bail!("unrecognized input '{}', try :help", line.trim()),
        };
        Ok((Flow::Continue, Some(output)))
    }
}

/// 优先使用 JSON 配置，文件不存在或加载失败时使用默认配置
fn load_settings() -> EngineSettings {
    match EngineSettings::from_json_file(SETTINGS_FILENAME) {
        Ok(settings) => settings,
        Err(ConfigError::NotFound(_)) => EngineSettings::default(),
        Err(e) => {
            tracing::warn!(error = %e, "using default settings");
            EngineSettings::default()
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut session = Session {
        settings: load_settings(),
        ..Default::default()
    };
    let mut editor = DefaultEditor::new()?;
    println!("query revisor, :help for commands");

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                editor.add_history_entry(line.as_str())?;
                match session.handle_input(&line) {
                    Ok((Flow::Quit, _)) => break,
                    Ok((Flow::Continue, Some(output))) => println!("{}", output),
                    Ok((Flow::Continue, None)) => {}
                    Err(e) => println!("Error: {:#}", e),
                }
            }
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {}", err);
                break;
            }
        }
    }

    Ok(())
}
