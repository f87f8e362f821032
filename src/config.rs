//! 引擎配置与插件配置
//!
//! [`EngineSettings`] 从 JSON 文件加载。[`PluginSettings`] 是注册插件步骤时附带的
//! 标记文档：包含命名的指令配置，以及存放 FetchXml 模板的 CDATA 块。
//!
//! ```text
//! <pluginSettings>
//!   <setting key="revise" name="{Replace}{ConditionValue}" value="{FetchXml}{parentaccountid}" />
//!   <node key="template"><![CDATA[<fetch>...</fetch>]]></node>
//! </pluginSettings>
//! ```

use crate::parser::{parse_markup, Element, ParseError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid plugin settings: {0}")]
    Markup(#[from] ParseError),
    #[error("expected <pluginSettings> root, found <{0}>")]
    UnexpectedRoot(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// 分页查询、批量执行和 SQL 渲染的可调参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 每页请求的记录数
    pub record_per_page: usize,
    /// 每次批量调用包含的请求数
    pub request_per_batch: usize,
    /// 批量调用是否返回每个请求的响应
    pub return_responses: bool,
    /// 实体名到表名的映射，渲染 SQL 时使用
    pub table_mappings: HashMap<String, String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            record_per_page: 1000,
            request_per_batch: 20,
            return_responses: true,
            table_mappings: HashMap::new(),
        }
    }
}

impl EngineSettings {
    /// 从 JSON 文件加载配置，缺失的字段使用默认值
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: EngineSettings = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.record_per_page == 0 {
            return Err(ConfigError::Zero("record_per_page"));
        }
        if self.request_per_batch == 0 {
            return Err(ConfigError::Zero("request_per_batch"));
        }
        Ok(())
    }
}

/// One `<setting>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub key: String,
    pub name: String,
    pub value: String,
}

/// A parsed plugin settings document.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSettings {
    root: Element,
}

impl PluginSettings {
    pub fn parse(markup: &str) -> Result<Self, ConfigError> {
        let root = parse_markup(markup)?;
        if root.name != "pluginSettings" {
            return Err(ConfigError::UnexpectedRoot(root.name));
        }
        Ok(Self { root })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// 返回第一个匹配 key 的配置，形式为 `(name, value)`
    pub fn setting(&self, key: &str) -> Option<(String, String)> {
        self.settings(Some(key))
            .into_iter()
            .next()
            .map(|s| (s.name, s.value))
    }

    /// 按文档顺序返回所有配置，可按 key 过滤
    pub fn settings(&self, key: Option<&str>) -> Vec<Setting> {
        self.root
            .elements()
            .filter(|e| e.name == "setting")
            .filter(|e| key.map_or(true, |k| e.attribute("key") == Some(k)))
            .map(|e| Setting {
                key: e.attribute("key").unwrap_or_default().to_string(),
                name: e.attribute("name").unwrap_or_default().to_string(),
                value: e.attribute("value").unwrap_or_default().to_string(),
            })
            .collect()
    }

    /// 指定 key 的 `<node>` 的文本内容（去除首尾空白）
    pub fn cdata(&self, node: &str) -> Option<String> {
        self.root
            .elements()
            .find(|e| e.name == "node" && e.attribute("key") == Some(node))
            .map(|e| e.text().trim().to_string())
    }
}
