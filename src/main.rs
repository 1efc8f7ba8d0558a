// ==========================================
// FWC 对账引擎 - 命令行入口
// ==========================================
// 用法:
//   fwc-reconcile ingest <file> [operator]
//   fwc-reconcile ingest-many <file>...
//   fwc-reconcile match <batch_id> [operator]
//   fwc-reconcile batches [page] [limit] [status]
//   fwc-reconcile detail <batch_id> [page] [limit] [matched|unmatched]
//   fwc-reconcile delete <batch_id>
//   fwc-reconcile export <batch_id> <csv_path>
// 数据库: FWC_RECON_DB_PATH 或用户数据目录
// ==========================================

use anyhow::{anyhow, bail, Context};
use fwc_reconciliation::api::{ApiError, ReconciliationApi};
use fwc_reconciliation::logging;
use serde::Serialize;
use std::path::PathBuf;

const USAGE: &str = "用法: fwc-reconcile <ingest|ingest-many|match|batches|detail|delete|export> [参数...]";

/// 默认数据库路径
fn get_default_db_path() -> String {
    // 允许通过环境变量显式指定 DB 路径（便于调试/测试）
    if let Ok(path) = std::env::var("FWC_RECON_DB_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./fwc_reconciliation.db");
    if let Some(data_dir) = dirs::data_dir() {
        let dir = data_dir.join("fwc-reconciliation");
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join("fwc_reconciliation.db");
        }
    }
    path.to_string_lossy().to_string()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_u32(arg: Option<&String>, default: u32, name: &str) -> anyhow::Result<u32> {
    match arg {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .with_context(|| format!("{} 必须是非负整数: {}", name, raw)),
        None => Ok(default),
    }
}

fn parse_matched_filter(arg: Option<&String>) -> anyhow::Result<Option<bool>> {
    match arg.map(|s| s.trim().to_lowercase()).as_deref() {
        None | Some("") | Some("all") => Ok(None),
        Some("matched") => Ok(Some(true)),
        Some("unmatched") => Ok(Some(false)),
        Some(other) => bail!("未知的匹配过滤: {}（matched / unmatched / all）", other),
    }
}

fn required<'a>(args: &'a [String], idx: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("缺少参数 <{}>\n{}", name, USAGE))
}

async fn run(api: &ReconciliationApi, args: &[String]) -> anyhow::Result<Result<(), ApiError>> {
    let command = required(args, 0, "command")?;
    let outcome = match command {
        "ingest" => {
            let file = required(args, 1, "file")?;
            let operator = args.get(2).map(String::as_str);
            match api.ingest_file(file, operator).await {
                Ok(resp) => {
                    print_json(&resp)?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        "ingest-many" => {
            if args.len() < 2 {
                bail!("缺少参数 <file>...\n{}", USAGE);
            }
            match api.ingest_files(args[1..].to_vec(), None).await {
                Ok(resp) => {
                    print_json(&resp)?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        "match" => {
            let batch_id = required(args, 1, "batch_id")?;
            let operator = args.get(2).map(String::as_str);
            match api.trigger_match(batch_id, operator).await {
                Ok(batch) => {
                    print_json(&batch)?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        "batches" => {
            let page = parse_u32(args.get(1), 1, "page")?;
            let limit = parse_u32(args.get(2), 20, "limit")?;
            let status = args.get(3).map(String::as_str);
            match api.list_batches(page, limit, status).await {
                Ok(page) => {
                    print_json(&page)?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        "detail" => {
            let batch_id = required(args, 1, "batch_id")?;
            let page = parse_u32(args.get(2), 1, "page")?;
            let limit = parse_u32(args.get(3), 50, "limit")?;
            let is_matched = parse_matched_filter(args.get(4))?;
            match api.get_batch_detail(batch_id, page, limit, is_matched).await {
                Ok(detail) => {
                    print_json(&detail)?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        "delete" => {
            let batch_id = required(args, 1, "batch_id")?;
            match api.delete_batch(batch_id).await {
                Ok(resp) => {
                    print_json(&resp)?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        "export" => {
            let batch_id = required(args, 1, "batch_id")?;
            let path = required(args, 2, "csv_path")?;
            match api.export_batch_csv(batch_id, path).await {
                Ok(resp) => {
                    print_json(&resp)?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        other => bail!("未知命令: {}\n{}", other, USAGE),
    };
    Ok(outcome)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let db_path = get_default_db_path();
    tracing::info!(version = fwc_reconciliation::VERSION, db_path = %db_path, "FWC 对账引擎启动");

    let api = ReconciliationApi::new(&db_path)
        .map_err(|e| anyhow!("无法初始化对账 API: {}", e))?;

    if let Err(api_err) = run(&api, &args).await? {
        tracing::error!(code = api_err.code(), error = %api_err, "命令执行失败");
        print_json(&api_err.to_response())?;
        std::process::exit(1);
    }
    Ok(())
}
