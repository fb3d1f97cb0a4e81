// installer.rs — 下载安装包并生成替换脚本
//
// 运行中的进程无法可靠地覆盖自身的可执行文件，所以这里不解压也不替换，
// 而是生成一个平台脚本：等待当前进程退出 → 解压 → 备份旧程序 → 复制新程序 → 重启 → 清理。
// 调用方负责执行脚本（StagedUpdate::launch）并随后退出进程。

use super::{UpdateError, http_client};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// 下载的超时上限
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 脚本开始替换前等待旧进程退出的秒数
const EXIT_GRACE_SECS: u32 = 2;

/// 流式下载安装包到 `destination`，失败时删除不完整的文件
pub async fn download_update(url: &str, destination: &Path) -> Result<PathBuf, UpdateError> {
    if url.is_empty() {
        return Err(UpdateError::NoAsset);
    }

    let io_err = |source| UpdateError::Io {
        path: destination.to_path_buf(),
        source,
    };
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    info!("downloading update from {url}");
    let result = stream_to_file(url, destination).await;
    match result {
        Ok(bytes) => {
            info!("downloaded {bytes} bytes to {}", destination.display());
            Ok(destination.to_path_buf())
        }
        Err(e) => {
            let _ = fs::remove_file(destination).await;
            Err(e)
        }
    }
}

async fn stream_to_file(url: &str, destination: &Path) -> Result<u64, UpdateError> {
    let io_err = |source| UpdateError::Io {
        path: destination.to_path_buf(),
        source,
    };

    let mut response = http_client(DOWNLOAD_TIMEOUT)
        .get(url)
        .send()
        .await
        .map_err(UpdateError::from_reqwest)?;
    if !response.status().is_success() {
        return Err(UpdateError::Status(response.status().as_u16()));
    }

    let mut file = File::create(destination).await.map_err(io_err)?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(UpdateError::from_reqwest)? {
        file.write_all(&chunk).await.map_err(io_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(io_err)?;
    Ok(written)
}

/// 脚本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Windows cmd 批处理，借助 PowerShell 的 Expand-Archive 解压
    Batch,
    /// POSIX sh，借助 unzip 解压
    Shell,
}

impl ScriptKind {
    pub fn current() -> Self {
        if cfg!(windows) {
            ScriptKind::Batch
        } else {
            ScriptKind::Shell
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ScriptKind::Batch => "cmd",
            ScriptKind::Shell => "sh",
        }
    }
}

/// 已生成、尚未执行的替换脚本
#[derive(Debug, Clone)]
pub struct StagedUpdate {
    pub script_path: PathBuf,
    pub archive_path: PathBuf,
    pub install_dir: PathBuf,
    kind: ScriptKind,
}

impl StagedUpdate {
    /// 以独立进程启动脚本；调用方随后应尽快退出
    pub fn launch(&self) -> Result<(), UpdateError> {
        let mut command = match self.kind {
            ScriptKind::Batch => {
                let mut c = Command::new("cmd");
                c.arg("/C").arg(&self.script_path);
                c
            }
            ScriptKind::Shell => {
                let mut c = Command::new("/bin/sh");
                c.arg(&self.script_path);
                c
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // 脱离当前进程组，避免终端信号连带结束脚本
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command.spawn().map_err(|source| UpdateError::Io {
            path: self.script_path.clone(),
            source,
        })?;
        info!(
            "launched update script {} ({} -> {})",
            self.script_path.display(),
            self.archive_path.display(),
            self.install_dir.display()
        );
        Ok(())
    }
}

/// 当前平台的可执行文件名
pub fn executable_name() -> String {
    format!("aiwall{}", std::env::consts::EXE_SUFFIX)
}

/// 生成替换脚本并写入临时目录
///
/// `restart_args` 为新程序启动时的参数，通常沿用当前进程的参数。
pub fn install_update(
    archive_path: &Path,
    install_dir: &Path,
    restart_args: &[String],
) -> Result<StagedUpdate, UpdateError> {
    let kind = ScriptKind::current();
    let script = render_script(kind, archive_path, install_dir, &executable_name(), restart_args);
    let script_path = std::env::temp_dir().join(format!("aiwall-update.{}", kind.extension()));

    let io_err = |source| UpdateError::Io {
        path: script_path.clone(),
        source,
    };
    std::fs::write(&script_path, script).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)) {
            warn!("could not mark update script executable: {e}");
        }
    }

    info!("staged update script at {}", script_path.display());
    Ok(StagedUpdate {
        script_path,
        archive_path: archive_path.to_path_buf(),
        install_dir: install_dir.to_path_buf(),
        kind,
    })
}

/// 生成脚本文本
pub fn render_script(
    kind: ScriptKind,
    archive_path: &Path,
    install_dir: &Path,
    exe_name: &str,
    restart_args: &[String],
) -> String {
    let archive = archive_path.to_string_lossy();
    let install_dir = install_dir.to_string_lossy();

    match kind {
        ScriptKind::Batch => {
            let args: Vec<String> = restart_args
                .iter()
                .map(|a| format!("\"{}\"", escape_batch(a)))
                .collect();
            BATCH_TEMPLATE
                .replace("{archive}", &escape_batch(&archive))
                .replace("{install_dir}", &escape_batch(&install_dir))
                .replace("{exe_name}", &escape_batch(exe_name))
                .replace("{grace}", &EXIT_GRACE_SECS.to_string())
                .replace("{args}", &args.join(" "))
        }
        ScriptKind::Shell => {
            let args: Vec<String> = restart_args.iter().map(|a| escape_sh(a)).collect();
            SHELL_TEMPLATE
                .replace("{archive}", &escape_sh(&archive))
                .replace("{install_dir}", &escape_sh(&install_dir))
                .replace("{exe_name}", &escape_sh(exe_name))
                .replace("{grace}", &EXIT_GRACE_SECS.to_string())
                .replace("{args}", &args.join(" "))
        }
    }
}

/// cmd 的 set "VAR=..." 中只有 % 需要转义
fn escape_batch(value: &str) -> String {
    value.replace('%', "%%")
}

/// 单引号包裹，内部的单引号写成 '\''
fn escape_sh(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

const BATCH_TEMPLATE: &str = r#"@echo off
setlocal
set "ARCHIVE={archive}"
set "INSTALL_DIR={install_dir}"
set "EXE_NAME={exe_name}"
set "EXTRACT_DIR=%TEMP%\aiwall-update-extract"

echo Waiting for aiwall to exit...
timeout /t {grace} /nobreak >nul

if exist "%EXTRACT_DIR%" rmdir /s /q "%EXTRACT_DIR%"
powershell -NoProfile -ExecutionPolicy Bypass -Command "Expand-Archive -LiteralPath $env:ARCHIVE -DestinationPath $env:EXTRACT_DIR -Force"
if errorlevel 1 (
    echo ERROR: failed to extract "%ARCHIVE%"
    pause
    exit /b 1
)

set "NEW_EXE="
for /r "%EXTRACT_DIR%" %%F in (%EXE_NAME%) do if exist "%%F" if not defined NEW_EXE set "NEW_EXE=%%F"
if not defined NEW_EXE (
    echo ERROR: %EXE_NAME% was not found in the update archive
    pause
    exit /b 1
)

if exist "%INSTALL_DIR%\%EXE_NAME%" copy /y "%INSTALL_DIR%\%EXE_NAME%" "%INSTALL_DIR%\%EXE_NAME%.bak" >nul
copy /y "%NEW_EXE%" "%INSTALL_DIR%\%EXE_NAME%" >nul
if errorlevel 1 (
    echo ERROR: failed to replace "%INSTALL_DIR%\%EXE_NAME%"
    pause
    exit /b 1
)

start "" "%INSTALL_DIR%\%EXE_NAME%" {args}

rmdir /s /q "%EXTRACT_DIR%"
del /q "%ARCHIVE%"
endlocal
"#;

const SHELL_TEMPLATE: &str = r#"#!/bin/sh
ARCHIVE={archive}
INSTALL_DIR={install_dir}
EXE_NAME={exe_name}
EXTRACT_DIR="${TMPDIR:-/tmp}/aiwall-update-extract"

echo "Waiting for aiwall to exit..."
sleep {grace}

rm -rf "$EXTRACT_DIR"
mkdir -p "$EXTRACT_DIR"
if ! unzip -oq "$ARCHIVE" -d "$EXTRACT_DIR"; then
    echo "ERROR: failed to extract $ARCHIVE" >&2
    exit 1
fi

NEW_EXE=$(find "$EXTRACT_DIR" -type f -name "$EXE_NAME" | head -n 1)
if [ -z "$NEW_EXE" ]; then
    echo "ERROR: $EXE_NAME was not found in the update archive" >&2
    exit 1
fi

if [ -f "$INSTALL_DIR/$EXE_NAME" ]; then
    cp -f "$INSTALL_DIR/$EXE_NAME" "$INSTALL_DIR/$EXE_NAME.bak"
fi
if ! { cp -f "$NEW_EXE" "$INSTALL_DIR/$EXE_NAME.new" && mv -f "$INSTALL_DIR/$EXE_NAME.new" "$INSTALL_DIR/$EXE_NAME"; }; then
    echo "ERROR: failed to replace $INSTALL_DIR/$EXE_NAME" >&2
    exit 1
fi
chmod +x "$INSTALL_DIR/$EXE_NAME"

nohup "$INSTALL_DIR/$EXE_NAME" {args} >/dev/null 2>&1 &

rm -rf "$EXTRACT_DIR"
rm -f "$ARCHIVE"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use tempfile::TempDir;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });
        format!("http://{addr}")
    }

    fn position(haystack: &str, needle: &str) -> usize {
        haystack
            .find(needle)
            .unwrap_or_else(|| panic!("missing {needle:?} in script"))
    }

    #[test]
    fn shell_script_escapes_paths_and_orders_steps() {
        let script = render_script(
            ScriptKind::Shell,
            Path::new("/tmp/it's here/update.zip"),
            Path::new("/opt/aiwall"),
            "aiwall",
            &["ui".to_string()],
        );
        assert!(script.contains(r#"ARCHIVE='/tmp/it'\''s here/update.zip'"#));
        assert!(script.contains("INSTALL_DIR='/opt/aiwall'"));
        assert!(script.contains("exit 1"));

        let backup = position(&script, "$EXE_NAME.bak");
        let replace = position(&script, "mv -f");
        let restart = position(&script, "nohup");
        let cleanup = position(&script, "rm -f \"$ARCHIVE\"");
        assert!(position(&script, "sleep 2") < backup);
        assert!(backup < replace && replace < restart && restart < cleanup);
        assert!(script.contains("nohup \"$INSTALL_DIR/$EXE_NAME\" 'ui'"));
    }

    #[test]
    fn batch_script_escapes_percent_signs() {
        let script = render_script(
            ScriptKind::Batch,
            Path::new(r"C:\Users\me\100% real\update.zip"),
            Path::new(r"C:\Program Files\aiwall"),
            "aiwall.exe",
            &["ui".to_string()],
        );
        assert!(script.contains(r#"set "ARCHIVE=C:\Users\me\100%% real\update.zip""#));
        assert!(script.contains(r#"set "INSTALL_DIR=C:\Program Files\aiwall""#));
        assert!(script.contains("was not found in the update archive"));
        assert!(script.contains(r#"start "" "%INSTALL_DIR%\%EXE_NAME%" "ui""#));
        assert!(position(&script, ".bak") < position(&script, "start \"\""));
        assert!(position(&script, "start \"\"") < position(&script, "del /q"));
    }

    #[test]
    fn staging_writes_the_script_without_touching_the_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("update.zip");
        std::fs::write(&archive, b"PK").unwrap();

        let staged = install_update(&archive, dir.path(), &[]).unwrap();
        let script = std::fs::read_to_string(&staged.script_path).unwrap();
        assert!(script.contains("update.zip"));
        assert_eq!(std::fs::read(&archive).unwrap(), b"PK");
        assert_eq!(staged.install_dir, dir.path());
    }

    #[tokio::test]
    async fn download_streams_to_nested_destination() {
        let payload = vec![7u8; 64 * 1024];
        let body = payload.clone();
        let router = Router::new().route("/pkg.zip", get(move || async move { body }));
        let base = serve(router).await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested").join("pkg.zip");
        let path = download_update(&format!("{base}/pkg.zip"), &dest).await.unwrap();
        assert_eq!(path, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[tokio::test]
    async fn download_failure_propagates_and_leaves_no_file() {
        let base = serve(Router::new()).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("pkg.zip");

        let err = download_update(&format!("{base}/missing.zip"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Status(404)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn empty_reference_cannot_be_downloaded() {
        let dir = TempDir::new().unwrap();
        let err = download_update("", &dir.path().join("x.zip")).await.unwrap_err();
        assert!(matches!(err, UpdateError::NoAsset));
    }
}
