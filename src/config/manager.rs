//! 配置管理器 - 负责处理不同环境下的配置覆盖
//!
//! 环境名称取自 `FLARE_ENV`（默认 development），
//! 对应 `config/environments/{environment}.toml` 会深度合并到基础配置之上。

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml::Value;

use super::merge_value;

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    pub fn get_environment() -> String {
        env::var("FLARE_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 环境配置文件路径
    pub fn environment_config_path(environment: &str) -> String {
        format!("config/environments/{}.toml", environment)
    }

    /// 根据环境叠加特定配置
    ///
    /// 文件不存在时直接返回 Ok(())
    pub fn apply_environment_overlay(base_config: &mut Value) -> Result<()> {
        let env = Self::get_environment();
        let env_config_path = Self::environment_config_path(&env);
        Self::apply_overlay_file(base_config, Path::new(&env_config_path))
    }

    /// 将指定文件深度合并到基础配置中
    pub fn apply_overlay_file(base_config: &mut Value, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("unable to read environment config: {}", path.display()))?;
        let overlay: Value = toml::from_str(&content)
            .with_context(|| format!("invalid environment config: {}", path.display()))?;

        merge_value(base_config, overlay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_config_path() {
        assert_eq!(
            ConfigManager::environment_config_path("production"),
            "config/environments/production.toml"
        );
    }

    #[test]
    fn test_missing_overlay_file_is_noop() {
        let mut base: Value = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        let before = base.clone();

        ConfigManager::apply_overlay_file(&mut base, Path::new("/no/such/overlay.toml")).unwrap();

        assert_eq!(base, before);
    }
}
