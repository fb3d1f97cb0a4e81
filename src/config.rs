// config.rs — 配置存储模块
// 设置以 KEY=VALUE 行格式保存；读取顺序：用户数据目录 → 应用目录 → 内置默认值

use chrono_tz::Tz;
use schemars::JsonSchema; // 引入用于生成 JSON Schema 的 trait
use serde::{Deserialize, Serialize}; // 引入序列化与反序列化 trait
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "config.env";

/// 用户数据目录下的应用子目录名
const APP_DIR_NAME: &str = "aiwall";

/// 当前唯一有效的图片生成接口地址
pub const CANONICAL_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-image:generateContent";

/// 已下线的模型标识；命中任意一个的 API_ENDPOINT 会被改写为 CANONICAL_ENDPOINT
const DEPRECATED_ENDPOINT_MARKERS: &[&str] = &[
    "gemini-2.0-flash-exp",
    "gemini-2.0-flash-preview-image-generation",
    "imagen-3.0-generate",
];

const DEFAULT_PROMPT: &str = "A breathtaking panoramic landscape at golden hour, \
     mountains and a calm lake, soft volumetric light, ultra detailed, desktop wallpaper";

/// 配置读写错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 无法确定平台的用户数据目录
    #[error("could not determine the user data directory")]
    NoDataDir,

    /// 文件系统读写失败
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 值不满足该键的约束
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: SettingKey,
        value: String,
        reason: String,
    },

    #[error("unknown setting key: {0}")]
    UnknownKey(String),
}

/// 配置文件中可识别的键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettingKey {
    ApiKey,
    ApiEndpoint,
    Prompt,
    AspectRatio,
    Resolution,
    OutputDir,
    LogLevel,
    ScheduleTime,
    Timezone,
}

impl SettingKey {
    /// 所有键，按写入文件时的顺序排列
    pub const ALL: [SettingKey; 9] = [
        SettingKey::ApiKey,
        SettingKey::ApiEndpoint,
        SettingKey::Prompt,
        SettingKey::AspectRatio,
        SettingKey::Resolution,
        SettingKey::OutputDir,
        SettingKey::LogLevel,
        SettingKey::ScheduleTime,
        SettingKey::Timezone,
    ];

    /// 文件中使用的键名
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::ApiKey => "API_KEY",
            SettingKey::ApiEndpoint => "API_ENDPOINT",
            SettingKey::Prompt => "PROMPT",
            SettingKey::AspectRatio => "ASPECT_RATIO",
            SettingKey::Resolution => "RESOLUTION",
            SettingKey::OutputDir => "OUTPUT_DIR",
            SettingKey::LogLevel => "LOG_LEVEL",
            SettingKey::ScheduleTime => "SCHEDULE_TIME",
            SettingKey::Timezone => "TIMEZONE",
        }
    }

    /// 文档约定的默认值
    pub fn default_value(self) -> &'static str {
        match self {
            SettingKey::ApiKey => "",
            SettingKey::ApiEndpoint => CANONICAL_ENDPOINT,
            SettingKey::Prompt => DEFAULT_PROMPT,
            SettingKey::AspectRatio => "16:9",
            SettingKey::Resolution => "2K",
            SettingKey::OutputDir => "~/Pictures/aiwall",
            SettingKey::LogLevel => "info",
            SettingKey::ScheduleTime => "09:00",
            // 空字符串表示使用系统本地时区
            SettingKey::Timezone => "",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = ConfigError;

    /// 大小写不敏感，CLI 中可以写 `prompt` 或 `schedule-time`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_");
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(&normalized))
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

/// 24 小时制的每日执行时间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleTime {
    pub hour: u32,
    pub minute: u32,
}

impl ScheduleTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }
}

impl FromStr for ScheduleTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| "expected HH:MM".to_string())?;
        // 小时允许一位或两位，分钟必须两位
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if h.is_empty() || h.len() > 2 || m.len() != 2 || !digits(h) || !digits(m) {
            return Err("expected HH:MM".to_string());
        }
        let hour: u32 = h.parse().map_err(|_| "hour is not a number".to_string())?;
        let minute: u32 = m.parse().map_err(|_| "minute is not a number".to_string())?;
        ScheduleTime::new(hour, minute).ok_or_else(|| "time out of range".to_string())
    }
}

impl TryFrom<String> for ScheduleTime {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleTime> for String {
    fn from(value: ScheduleTime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// 生成图片的分辨率档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Resolution {
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::OneK => "1K",
            Resolution::TwoK => "2K",
            Resolution::FourK => "4K",
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1K" => Ok(Resolution::OneK),
            "2K" => Ok(Resolution::TwoK),
            "4K" => Ok(Resolution::FourK),
            _ => Err("expected one of 1K, 2K, 4K".to_string()),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 应用设置
///
/// 每个字段对应配置文件中的一个键，缺失的键使用 [`SettingKey::default_value`]。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// 图片生成服务的 API Key（为空时无法生成）
    pub api_key: String,
    /// 图片生成接口地址
    pub api_endpoint: String,
    /// 生成提示词
    pub prompt: String,
    /// 宽高比，如 "16:9"
    pub aspect_ratio: String,
    pub resolution: Resolution,
    /// 壁纸保存目录（支持 ~、$HOME 等环境变量，相对路径则相对于 $HOME）
    pub output_dir: String,
    /// 日志级别（RUST_LOG 未设置时生效）
    pub log_level: String,
    /// 每日执行时间 HH:MM
    #[schemars(with = "String")]
    pub schedule_time: ScheduleTime,
    /// IANA 时区名，如 "Asia/Shanghai"；为空表示系统本地时区
    pub timezone: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_endpoint: CANONICAL_ENDPOINT.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            aspect_ratio: SettingKey::AspectRatio.default_value().to_string(),
            resolution: Resolution::TwoK,
            output_dir: SettingKey::OutputDir.default_value().to_string(),
            log_level: SettingKey::LogLevel.default_value().to_string(),
            schedule_time: ScheduleTime { hour: 9, minute: 0 },
            timezone: String::new(),
        }
    }
}

impl Settings {
    /// 从原始键值表构建设置，缺失或非法的值回退到默认值
    pub fn from_map(raw: &BTreeMap<String, String>) -> Self {
        let mut settings = Settings::default();
        for key in SettingKey::ALL {
            if let Some(value) = raw.get(key.as_str()) {
                if let Err(e) = settings.set(key, value) {
                    warn!("{e}; falling back to default {:?}", key.default_value());
                }
            }
        }
        settings
    }

    /// 读取某个键的字符串值
    pub fn get(&self, key: SettingKey) -> String {
        match key {
            SettingKey::ApiKey => self.api_key.clone(),
            SettingKey::ApiEndpoint => self.api_endpoint.clone(),
            SettingKey::Prompt => self.prompt.clone(),
            SettingKey::AspectRatio => self.aspect_ratio.clone(),
            SettingKey::Resolution => self.resolution.to_string(),
            SettingKey::OutputDir => self.output_dir.clone(),
            SettingKey::LogLevel => self.log_level.clone(),
            SettingKey::ScheduleTime => self.schedule_time.to_string(),
            SettingKey::Timezone => self.timezone.clone(),
        }
    }

    /// 校验并设置某个键；API_ENDPOINT 会经过旧地址修正
    pub fn set(&mut self, key: SettingKey, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason,
        };

        match key {
            SettingKey::ApiKey => self.api_key = value.trim().to_string(),
            SettingKey::ApiEndpoint => {
                let value = value.trim();
                if value.is_empty() {
                    return Err(invalid("endpoint must not be empty".to_string()));
                }
                self.api_endpoint = correct_endpoint(value).unwrap_or(value).to_string();
            }
            SettingKey::Prompt => self.prompt = value.to_string(),
            SettingKey::AspectRatio => {
                let (w, h) = value
                    .trim()
                    .split_once(':')
                    .ok_or_else(|| invalid("expected W:H".to_string()))?;
                if w.parse::<u32>().is_err() || h.parse::<u32>().is_err() {
                    return Err(invalid("expected W:H".to_string()));
                }
                self.aspect_ratio = value.trim().to_string();
            }
            SettingKey::Resolution => self.resolution = value.parse().map_err(invalid)?,
            SettingKey::OutputDir => {
                if value.trim().is_empty() {
                    return Err(invalid("output directory must not be empty".to_string()));
                }
                self.output_dir = value.trim().to_string();
            }
            SettingKey::LogLevel => self.log_level = value.trim().to_string(),
            SettingKey::ScheduleTime => self.schedule_time = value.parse().map_err(invalid)?,
            SettingKey::Timezone => {
                let value = value.trim();
                if !value.is_empty() {
                    value
                        .parse::<Tz>()
                        .map_err(|_| invalid("unknown IANA time zone".to_string()))?;
                }
                self.timezone = value.to_string();
            }
        }
        Ok(())
    }

    /// 展开后的壁纸保存目录
    pub fn output_dir(&self) -> PathBuf {
        expand_path(&self.output_dir)
    }

    /// 解析后的时区；None 表示使用系统本地时区
    pub fn time_zone(&self) -> Option<Tz> {
        if self.timezone.is_empty() {
            None
        } else {
            self.timezone.parse().ok()
        }
    }

    /// 获取设置结构的 JSON Schema
    pub fn schema() -> String {
        let schema = schemars::schema_for!(Settings);
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    }
}

/// 若地址命中已下线的模型标识，返回修正后的地址
pub fn correct_endpoint(value: &str) -> Option<&'static str> {
    if value == CANONICAL_ENDPOINT {
        return None;
    }
    DEPRECATED_ENDPOINT_MARKERS
        .iter()
        .any(|marker| value.contains(marker))
        .then_some(CANONICAL_ENDPOINT)
}

/// 展开路径中的 ~ 和环境变量 ($HOME, ${XDG_PICTURES_DIR} 等)
fn expand_path(path_str: &str) -> PathBuf {
    // 未定义的变量不视为错误，只展开 ~
    let expanded = shellexpand::full(path_str)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(path_str).into_owned());
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        p
    } else {
        dirs::home_dir().unwrap_or_default().join(p)
    }
}

/// 分层配置存储
///
/// 读：按顺序取第一个存在的文件（用户数据目录，然后应用目录）。
/// 写：写入用户数据目录；开发模式下同时写一份到应用目录。
#[derive(Debug, Clone)]
pub struct ConfigStore {
    user_path: PathBuf,
    app_path: Option<PathBuf>,
    mirror_to_app: bool,
}

impl ConfigStore {
    pub fn new(user_path: PathBuf, app_path: Option<PathBuf>, mirror_to_app: bool) -> Self {
        Self {
            user_path,
            app_path,
            mirror_to_app,
        }
    }

    /// 按平台约定定位配置文件
    ///
    /// debug 构建视为开发模式：应用目录取当前工作目录，并镜像写入。
    /// release 构建的应用目录为可执行文件所在目录，只读不写。
    pub fn discover() -> Result<Self, ConfigError> {
        let data_dir = dirs::data_dir().ok_or(ConfigError::NoDataDir)?;
        let user_path = data_dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME);

        let dev_mode = cfg!(debug_assertions);
        let app_dir = if dev_mode {
            std::env::current_dir().ok()
        } else {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
        };

        Ok(Self::new(
            user_path,
            app_dir.map(|dir| dir.join(CONFIG_FILE_NAME)),
            dev_mode,
        ))
    }

    /// 写入位置
    pub fn path(&self) -> &Path {
        &self.user_path
    }

    /// 读取时依次尝试的位置
    pub fn candidates(&self) -> Vec<&Path> {
        std::iter::once(self.user_path.as_path())
            .chain(self.app_path.as_deref())
            .collect()
    }

    /// 读取设置，永不失败
    pub fn load(&self) -> Settings {
        let Some((source, mut raw)) = self.read_raw() else {
            debug!("no config file found, using defaults");
            return Settings::default();
        };

        let key = SettingKey::ApiEndpoint.as_str();
        let corrected = raw
            .get(key)
            .and_then(|stored| correct_endpoint(stored.trim()));
        if let Some(canonical) = corrected {
            info!("migrating deprecated {key} in {}", source.display());
            raw.insert(key.to_string(), canonical.to_string());
            persist_in_background(source, raw.clone());
        }

        Settings::from_map(&raw)
    }

    /// 合并并保存部分设置，返回合并后的完整设置
    pub fn save(&self, updates: &[(SettingKey, String)]) -> Result<Settings, ConfigError> {
        let mut raw = self.read_raw().map(|(_, raw)| raw).unwrap_or_default();
        let mut settings = Settings::from_map(&raw);

        let previous_output_dir = settings.output_dir.clone();
        for (key, value) in updates {
            settings.set(*key, value)?;
        }
        if settings.output_dir != previous_output_dir {
            ensure_writable(&settings.output_dir()).map_err(|e| ConfigError::InvalidValue {
                key: SettingKey::OutputDir,
                value: settings.output_dir.clone(),
                reason: format!("directory is not writable: {e}"),
            })?;
        }
        for key in SettingKey::ALL {
            raw.insert(key.as_str().to_string(), settings.get(key));
        }

        write_env_file(&self.user_path, &raw)?;
        if self.mirror_to_app {
            if let Some(app_path) = self.app_path.as_ref().filter(|p| **p != self.user_path) {
                write_env_file(app_path, &raw)?;
            }
        }

        info!("saved config to {}", self.user_path.display());
        Ok(settings)
    }

    /// 读取第一个可读的候选文件
    fn read_raw(&self) -> Option<(PathBuf, BTreeMap<String, String>)> {
        for path in self.candidates() {
            match fs::read_to_string(path) {
                Ok(content) => return Some((path.to_path_buf(), parse_env(&content))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => warn!("failed to read {}: {e}", path.display()),
            }
        }
        None
    }
}

/// 尽力而为地把修正写回文件，不阻塞也不报错
fn persist_in_background(path: PathBuf, raw: BTreeMap<String, String>) {
    let write = move || {
        if let Err(e) = write_env_file(&path, &raw) {
            debug!("could not rewrite migrated config: {e}");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(write);
        }
        Err(_) => write(),
    }
}

/// 创建目录并试写一个临时文件
fn ensure_writable(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let marker = dir.join(".aiwall-write-check");
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&marker)?;
    fs::remove_file(&marker)
}

fn write_env_file(path: &Path, raw: &BTreeMap<String, String>) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, render_env(raw)).map_err(io_err)
}

/// 解析 KEY=VALUE 文本
pub fn parse_env(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            debug!("ignoring malformed config line: {line}");
            continue;
        };
        map.insert(key.trim().to_string(), unquote_value(value.trim()));
    }
    map
}

/// 按固定顺序输出：已知键在前，其余未知键保留在后
pub fn render_env(raw: &BTreeMap<String, String>) -> String {
    let known: Vec<&str> = SettingKey::ALL.iter().map(|k| k.as_str()).collect();
    let mut out = String::from("# aiwall configuration\n");

    for key in &known {
        if let Some(value) = raw.get(*key) {
            out.push_str(&format!("{key}={}\n", quote_value(value)));
        }
    }
    for (key, value) in raw.iter().filter(|(k, _)| !known.contains(&k.as_str())) {
        out.push_str(&format!("{key}={}\n", quote_value(value)));
    }
    out
}

/// 含空白或保留字符的值用双引号包裹；换行写成 \n，保证一行一个键
fn quote_value(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '#' | '=' | '"' | '\\'));
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r");
    format!("\"{escaped}\"")
}

fn unquote_value(raw: &str) -> String {
    let Some(body) = raw.strip_prefix('"') else {
        // 未加引号的值：空白后的 # 视为行内注释
        let end = raw
            .char_indices()
            .find(|&(i, c)| c == '#' && raw[..i].ends_with(char::is_whitespace))
            .map(|(i, _)| i)
            .unwrap_or(raw.len());
        return raw[..end].trim_end().to_string();
    };

    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some(next @ ('"' | '\\')) => out.push(next),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            _ => out.push(c),
        }
    }
    out
}
