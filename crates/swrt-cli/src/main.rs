//! SW Runtime CLI - run, evaluate and bundle scripts
//!
//! Usage:
//!   swrt run app.ts                         # Execute a script file
//!   swrt run -w app.ts                      # Re-run on source changes
//!   swrt eval "console.log(1 + 2)"          # Execute a code string
//!   swrt bundle app.ts -o dist/app.js       # Bundle a project into one file
//!   swrt bundle app.js --encrypt            # Bundle and encrypt (writes <out>.key)
//!   swrt run --decrypt-key-file=app.bundle.js.key app.bundle.js

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use swrt::{BundleOptions, BundleResult, Bundler, FILE_PERM_EXCLUSIVE, Runtime};
use tracing_subscriber::EnvFilter;

mod watch;

/// SW Runtime - JavaScript/TypeScript runtime and bundler
#[derive(Parser, Debug)]
#[command(name = "swrt")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a JavaScript or TypeScript file
    Run {
        script: PathBuf,

        /// Clear the module cache before running
        #[arg(short = 'c', long)]
        clear_cache: bool,

        /// Working directory (module base and file sandbox base)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Key for an encrypted bundle
        #[arg(long)]
        decrypt_key: Option<String>,

        /// File containing the key for an encrypted bundle
        #[arg(long, conflicts_with = "decrypt_key")]
        decrypt_key_file: Option<PathBuf>,

        /// Re-run the script when a .js/.ts/.tsx/.json file next to it changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Execute a code snippet
    Eval { code: String },

    /// Bundle a project into a single script
    Bundle {
        entry: PathBuf,

        /// Output path (default: <entry>.bundle.js)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Minify the output
        #[arg(short, long)]
        minify: bool,

        /// Inline a source map
        #[arg(long)]
        sourcemap: bool,

        /// Files to leave out of the module report (comma separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<PathBuf>,

        /// Encrypt the bundle (AES-256-GCM)
        #[arg(long)]
        encrypt: bool,

        /// Encryption key (base64, 32 bytes); generated when omitted
        #[arg(long, requires = "encrypt")]
        encrypt_key: Option<String>,
    },

    /// Show version information
    Version,

    /// Show runtime information
    Info,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);
    let out = Printer {
        verbose: args.verbose && !args.quiet,
        quiet: args.quiet,
    };

    let outcome = match args.command {
        Command::Run {
            script,
            clear_cache,
            dir,
            decrypt_key,
            decrypt_key_file,
            watch,
        } => run(
            &out,
            &script,
            RunOptions {
                clear_cache,
                dir,
                decrypt_key,
                decrypt_key_file,
                watch,
            },
        )
        .map_err(|e| ("运行失败", e)),
        Command::Eval { code } => eval(&out, &code).map_err(|e| ("执行失败", e)),
        Command::Bundle {
            entry,
            output,
            minify,
            sourcemap,
            exclude,
            encrypt,
            encrypt_key,
        } => {
            let mut options = BundleOptions::new(entry)
                .minify(minify)
                .sourcemap(sourcemap)
                .encrypt(encrypt);
            if let Some(output) = output {
                options = options.output(output);
            }
            if let Some(key) = encrypt_key {
                options = options.encrypt_key(key);
            }
            for path in exclude {
                options = options.exclude(path);
            }
            bundle(&out, options)
        }
        Command::Version => {
            version();
            Ok(())
        }
        Command::Info => info(),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err((label, err)) => {
            eprintln!("❌ {label}: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise warn, debug for the runtime with `-v`, error
/// with `-q`.
fn init_tracing(verbose: bool, quiet: bool) {
    let default = match (verbose, quiet) {
        (_, true) => "error",
        (true, false) => "warn,swrt=debug",
        (false, false) => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Progress output gated on `--verbose` / `--quiet`.
struct Printer {
    verbose: bool,
    quiet: bool,
}

impl Printer {
    fn verbose(&self, line: impl AsRef<str>) {
        if self.verbose {
            println!("{}", line.as_ref());
        }
    }

    fn normal(&self, line: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", line.as_ref());
        }
    }
}

type Outcome = std::result::Result<(), (&'static str, anyhow::Error)>;

struct RunOptions {
    clear_cache: bool,
    dir: Option<PathBuf>,
    decrypt_key: Option<String>,
    decrypt_key_file: Option<PathBuf>,
    watch: bool,
}

fn run(out: &Printer, script: &Path, options: RunOptions) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let script = swrt::absolutize(script, &cwd);
    if !script.is_file() {
        bail!("文件不存在: {}", script.display());
    }
    if options.watch && (options.decrypt_key.is_some() || options.decrypt_key_file.is_some()) {
        bail!("加密文件暂不支持监控模式");
    }
    if let Some(dir) = &options.dir {
        if !dir.is_dir() {
            bail!("工作目录不存在: {}", dir.display());
        }
    }
    let key = match (options.decrypt_key, options.decrypt_key_file) {
        (Some(key), _) => Some(key),
        (None, Some(path)) => Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("读取密钥文件失败: {}", path.display()))?
                .trim()
                .to_string(),
        ),
        (None, None) => None,
    };
    if key.is_some() {
        out.verbose("🔓 使用解密密钥运行");
    }
    if options.clear_cache {
        out.verbose("🧹 已清除模块缓存");
    }

    let dir = options.dir;
    let clear_cache = options.clear_cache;
    let make_runtime = move || -> swrt::Result<Runtime> {
        let mut builder = Runtime::builder();
        if let Some(dir) = &dir {
            builder = builder.working_dir(dir.clone());
        }
        if let Some(key) = &key {
            builder = builder.decrypt_key(key.clone());
        }
        let runtime = builder.build()?;
        if clear_cache {
            runtime.clear_module_cache();
        }
        Ok(runtime)
    };

    if options.watch {
        return watch::watch(out, &script, make_runtime);
    }

    let runtime = make_runtime().context("创建运行时失败")?;
    out.verbose(format!("🚀 正在运行: {}", script.display()));
    runtime.run_file(&script)?;
    out.verbose("✅ 执行完成");
    Ok(())
}

fn eval(out: &Printer, code: &str) -> Result<()> {
    out.verbose("📝 执行代码:");
    out.verbose(code);
    out.verbose("---");
    let runtime = Runtime::new().context("创建运行时失败")?;
    runtime.run_code(code)?;
    out.verbose("---");
    out.verbose("✅ 执行完成");
    Ok(())
}

fn bundle(out: &Printer, options: BundleOptions) -> Outcome {
    if !options.entry.is_file() {
        return Err((
            "入口文件不存在",
            anyhow::anyhow!("{}", options.entry.display()),
        ));
    }
    let output = options
        .output
        .clone()
        .unwrap_or_else(|| BundleOptions::default_output(&options.entry));
    let supplied_key = options.encrypt_key.clone();
    let sourcemap = options.sourcemap;

    out.normal(format!("📦 正在打包: {}", options.entry.display()));
    let result = Bundler::new(options)
        .and_then(Bundler::bundle)
        .map_err(|e| ("打包失败", e.into()))?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ("写入文件失败", e.into()))?;
    }
    std::fs::write(&output, &result.code).map_err(|e| ("写入文件失败", e.into()))?;

    let map_file = sidecar(&output, "map");
    if let Some(map) = &result.source_map {
        if let Err(e) = std::fs::write(&map_file, map) {
            eprintln!("⚠️  写入 sourcemap 失败: {e}");
        }
    }

    let key = result.encrypt_key.clone().or(supplied_key);
    let key_file = sidecar(&output, "key");
    if result.encrypted {
        if let Some(key) = &key {
            if let Err(e) = write_key_file(&key_file, key) {
                eprintln!("⚠️  写入密钥文件失败: {e:#}");
            }
        }
    }

    report(out, &result, &output, sourcemap.then_some(map_file.as_path()));
    if result.encrypted {
        if let Some(key) = &key {
            out.normal("\n🔒 加密信息:");
            out.normal("✅ 代码已加密 (AES-256-GCM)");
            out.normal(format!("🔑 密钥文件: {}", key_file.display()));
            out.normal(format!("📝 密钥内容: {key}"));
            out.normal("\n⚠️  请保管好密钥文件，运行时需要：");
            out.normal(format!("   swrt run --decrypt-key={key} {}", output.display()));
            out.normal("   或");
            out.normal(format!(
                "   swrt run --decrypt-key-file={} {}",
                key_file.display(),
                output.display()
            ));
        }
    }
    Ok(())
}

fn report(out: &Printer, result: &BundleResult, output: &Path, map_file: Option<&Path>) {
    out.normal("\n✅ 打包完成!\n");
    out.normal(format!("📄 输出文件: {}", output.display()));
    out.normal(format!(
        "📊 文件大小: {:.2} KB",
        result.code.len() as f64 / 1024.0
    ));
    out.normal(format!("📦 包含模块: {} 个", result.modules.len()));
    if out.verbose {
        println!("\n包含的模块:");
        for module in &result.modules {
            println!("  • {}", module.display());
        }
    }
    match (map_file, &result.source_map) {
        (Some(path), Some(_)) => out.normal(format!("🗺️  Source Map: {}", path.display())),
        (Some(_), None) => out.normal("🗺️  Source Map: inline"),
        _ => {}
    }
}

/// `<output>.<ext>`, keeping the full output file name.
fn sidecar(output: &Path, ext: &str) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Write the key readable by the owner only.
fn write_key_file(path: &Path, key: &str) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(FILE_PERM_EXCLUSIVE);
        let mut file = options.open(path)?;
        // `mode` only applies on creation; tighten a pre-existing file too.
        file.set_permissions(std::fs::Permissions::from_mode(FILE_PERM_EXCLUSIVE))?;
        file.write_all(key.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        let _ = FILE_PERM_EXCLUSIVE;
        options.open(path)?.write_all(key.as_bytes())?;
    }
    Ok(())
}

fn version() {
    println!("SW Runtime v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "OS/Arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

fn info() -> Outcome {
    let runtime = Runtime::new().map_err(|e| ("创建运行时失败", e.into()))?;

    println!("╔════════════════════════════════════════════════════════╗");
    println!("║           SW Runtime 运行时信息                        ║");
    println!("╚════════════════════════════════════════════════════════╝");
    println!();
    println!("📦 内置模块:");
    for module in runtime.builtin_modules() {
        println!("   • {module}");
    }
    println!();
    println!("🔗 外部模块 (打包时保留 require):");
    println!("   {}", swrt::BUILTIN_MODULE_NAMES.join(", "));
    println!();
    println!("✨ 核心功能:");
    for feature in [
        "TypeScript 支持",
        "ES6+ 语法 (import/export)",
        "Promise/async-await",
        "定时器 (setTimeout/setInterval)",
        "HTTP 客户端 (拦截器/流式响应/文件上传)",
        "SSRF 防护与路径沙箱",
        "打包 (压缩/Source Map/AES-256-GCM 加密)",
    ] {
        println!("   ✓ {feature}");
    }
    println!();
    println!("💡 快速开始:");
    println!("   swrt run app.ts        运行脚本");
    println!("   swrt eval \"code\"       执行代码");
    println!("   swrt bundle app.ts     打包项目");
    println!("   swrt version           查看版本");
    println!("   swrt --help            查看帮助");
    println!();
    Ok(())
}
