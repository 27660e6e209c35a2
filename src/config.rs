//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WAYPOINT__*` 覆盖（双下划线表示嵌套，如 `WAYPOINT__LLM__PROVIDER=azure`）。
//! 凭据在这里解析完毕：Model Gateway 只接收显式的配置值，自己不读环境变量。

use std::path::PathBuf;

use serde::Deserialize;

use crate::tools::UnknownToolPolicy;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a kind, knowledgeable AI assistant. Use the available tools as needed to answer accurately.";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub checkpoint: CheckpointSection,
    pub agent: AgentSection,
}

/// 模型后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Azure,
    /// 离线回显，无需 API Key
    Mock,
}

/// [llm] 段：后端选择、模型参数与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: LlmProvider,
    pub model: String,
    /// OpenAI 兼容端点；未设置时用 https://api.openai.com/v1
    pub base_url: Option<String>,
    /// 未设置时由 load_config 从 OPENAI_API_KEY / AZURE_OPENAI_API_KEY 解析
    pub api_key: Option<String>,
    pub temperature: f32,
    pub streaming: bool,
    pub timeout_secs: u64,
    pub azure: AzureSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: "gpt-4o".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.0,
            streaming: true,
            timeout_secs: 60,
            azure: AzureSection::default(),
        }
    }
}

/// [llm.azure] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AzureSection {
    pub endpoint: Option<String>,
    /// 部署名；未设置时用 llm.model
    pub deployment: Option<String>,
    pub api_version: String,
}

impl Default for AzureSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            deployment: None,
            api_version: "2024-10-21".to_string(),
        }
    }
}

/// 检查点后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Sqlite,
    Postgres,
    Memory,
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub backend: CheckpointBackend,
    pub sqlite_path: PathBuf,
    /// 完整连接串；设置后忽略 [checkpoint.postgres]
    pub postgres_url: Option<String>,
    pub postgres: PostgresSection,
    pub max_connections: u32,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            sqlite_path: PathBuf::from("checkpoints.db"),
            postgres_url: None,
            postgres: PostgresSection::default(),
            max_connections: 5,
        }
    }
}

/// [checkpoint.postgres] 段：分项连接参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresSection {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl Default for PostgresSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "waypoint".to_string(),
            user: "postgres".to_string(),
            password: None,
        }
    }
}

/// [agent] 段：循环参数与工具执行策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub system_prompt: String,
    /// 单轮最多状态转移次数
    pub max_steps: usize,
    pub unknown_tool: UnknownToolPolicy,
    pub max_concurrent_tools: usize,
    /// 单次工具调用超时（秒）；未设置时不限时
    pub tool_timeout_secs: Option<u64>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: 25,
            unknown_tool: UnknownToolPolicy::default(),
            max_concurrent_tools: 4,
            tool_timeout_secs: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 WAYPOINT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 WAYPOINT__*（双下划线表示嵌套键）
/// 4. 无前缀的 USE_AZURE / LLM_MODEL / CHECKPOINT_TYPE / POSTGRES_* 等填补仍为默认值的字段
/// 5. llm.api_key 仍为空时按 provider 读取 OPENAI_API_KEY / AZURE_OPENAI_API_KEY
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if !path.exists() {
            return Err(config::ConfigError::NotFound(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path.clone()));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WAYPOINT")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.resolve_credentials(|key| std::env::var(key).ok());
    Ok(cfg)
}

impl AppConfig {
    /// 补全未显式配置的凭据与 Azure 端点；lookup 通常是 std::env::var
    ///
    /// 先应用无前缀的环境变量（USE_AZURE、LLM_MODEL、CHECKPOINT_TYPE、POSTGRES_* 等），
    /// 它们只填补仍为内置默认值的字段，不覆盖文件或 WAYPOINT__* 给出的值。
    pub fn resolve_credentials(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        self.apply_plain_env(&lookup);

        let llm = &mut self.llm;
        if llm.api_key.as_deref().map_or(true, str::is_empty) {
            llm.api_key = match llm.provider {
                LlmProvider::OpenAi => lookup("OPENAI_API_KEY"),
                LlmProvider::Azure => lookup("AZURE_OPENAI_API_KEY"),
                LlmProvider::Mock => None,
            };
        }
        if llm.provider == LlmProvider::Azure {
            if llm.azure.endpoint.is_none() {
                llm.azure.endpoint =
                    lookup("AZURE_OPENAI_ENDPOINT").or_else(|| lookup("AZURE_ENDPOINT"));
            }
            if llm.azure.deployment.is_none() {
                llm.azure.deployment = lookup("AZURE_OPENAI_API_DEPLOYMENT_ID");
            }
        }
    }

    fn apply_plain_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        let llm_default = LlmSection::default();
        let llm = &mut self.llm;
        if llm.provider == llm_default.provider
            && lookup("USE_AZURE").is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            llm.provider = LlmProvider::Azure;
        }
        if llm.model == llm_default.model {
            if let Some(model) = lookup("LLM_MODEL") {
                llm.model = model;
            }
        }
        if llm.azure.api_version == llm_default.azure.api_version {
            if let Some(version) = lookup("AZURE_OPENAI_API_VERSION") {
                llm.azure.api_version = version;
            }
        }

        let checkpoint = &mut self.checkpoint;
        if checkpoint.backend == CheckpointBackend::default() {
            match lookup("CHECKPOINT_TYPE").map(|v| v.to_ascii_lowercase()).as_deref() {
                Some("postgres") => checkpoint.backend = CheckpointBackend::Postgres,
                Some("memory") => checkpoint.backend = CheckpointBackend::Memory,
                Some("sqlite") | None => {}
                Some(other) => {
                    tracing::warn!(value = %other, "ignoring unknown CHECKPOINT_TYPE");
                }
            }
        }

        let pg_default = PostgresSection::default();
        let pg = &mut checkpoint.postgres;
        if pg.host == pg_default.host {
            if let Some(host) = lookup("POSTGRES_HOST") {
                pg.host = host;
            }
        }
        if pg.port == pg_default.port {
            if let Some(port) = lookup("POSTGRES_PORT").and_then(|v| v.trim().parse().ok()) {
                pg.port = port;
            }
        }
        if pg.database == pg_default.database {
            if let Some(database) = lookup("POSTGRES_DB") {
                pg.database = database;
            }
        }
        if pg.user == pg_default.user {
            if let Some(user) = lookup("POSTGRES_USER") {
                pg.user = user;
            }
        }
        if pg.password.is_none() {
            pg.password = lookup("POSTGRES_PASSWORD");
        }
    }
}
