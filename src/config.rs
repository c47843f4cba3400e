//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AGENTFLOW__*` 覆盖（双下划线表示嵌套，如 `AGENTFLOW__GATEWAY__BIND_ADDR=0.0.0.0:9100`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestration: OrchestrationConfig,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
}

/// [orchestration] 段：编排实例的生命周期与出站缓冲
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// 实例闲置多久后被清理
    pub idle_timeout_secs: u64,
    /// 同时存活的实例上限，超出时驱逐最久未活跃者
    pub max_instances: usize,
    pub cleanup_interval_secs: u64,
    /// 每个实例的出站信封广播缓冲
    pub envelope_buffer: usize,
    /// 出站信封的 `from`
    pub agent_name: String,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            max_instances: 1024,
            cleanup_interval_secs: 60,
            envelope_buffer: 256,
            agent_name: "agentflow".to_string(),
        }
    }
}

/// [gateway] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub heartbeat_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

/// [storage] 段：未设置 db_path 时使用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: Option<PathBuf>,
}

/// [engine] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// 启动时导入的状态机定义（JSON 数组）
    pub definitions_file: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 AGENTFLOW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AGENTFLOW__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AGENTFLOW")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.orchestration.idle_timeout_secs, 1800);
        assert_eq!(config.orchestration.max_instances, 1024);
        assert_eq!(config.gateway.bind_addr, "127.0.0.1:9100");
        assert!(config.storage.db_path.is_none());
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[orchestration]\nmax_instances = 8\n\n[storage]\ndb_path = \"data/agentflow.db\""
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.orchestration.max_instances, 8);
        // 未出现的键保持默认
        assert_eq!(config.orchestration.cleanup_interval_secs, 60);
        assert_eq!(
            config.storage.db_path,
            Some(PathBuf::from("data/agentflow.db"))
        );
    }
}
