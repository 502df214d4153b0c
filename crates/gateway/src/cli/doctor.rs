use sa_domain::config::{Config, ConfigSeverity};

/// Run all diagnostic checks and print a summary.
///
/// Returns `Ok(true)` when every check passes, `Ok(false)` when at least
/// one check failed.
pub async fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("serialagent doctor");
    println!("==================\n");

    let mut all_passed = true;

    check_config_file(config_path, &mut all_passed);
    check_config_validation(config, &mut all_passed);
    check_data_root(config, &mut all_passed);
    check_api_key(config, &mut all_passed);
    check_mcp_servers(config);

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

// ── Individual checks ─────────────────────────────────────────────────

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists { config_path.to_owned() } else { format!("{config_path} not found (using defaults)") },
    );
    if !exists {
        *all_passed = false;
    }
}

fn check_config_validation(config: &Config, all_passed: &mut bool) {
    let issues = config.validate();
    let error_count = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({} error(s))", issues.len(), error_count),
        );
        for issue in &issues {
            println!("      {issue}");
        }
        if error_count > 0 {
            *all_passed = false;
        }
    }
}

fn check_data_root(config: &Config, all_passed: &mut bool) {
    let path = &config.store.data_root;
    if std::fs::create_dir_all(path).is_err() {
        print_check("Data root writable", false, format!("{} (cannot create)", path.display()));
        *all_passed = false;
        return;
    }
    let probe = path.join(".serialagent_doctor_probe");
    let writable = std::fs::write(&probe, b"probe").is_ok();
    let _ = std::fs::remove_file(&probe);

    print_check(
        "Data root writable",
        writable,
        if writable { format!("{} (writable)", path.display()) } else { format!("{} (not writable)", path.display()) },
    );
    if !writable {
        *all_passed = false;
    }
}

fn check_api_key(config: &Config, all_passed: &mut bool) {
    let Some(env_var) = &config.llm.api_key_env else {
        print_check("LLM API key", true, "no api_key_env configured (unauthenticated endpoint)".into());
        return;
    };
    let set = std::env::var(env_var).map(|v| !v.is_empty()).unwrap_or(false);
    print_check(
        "LLM API key",
        set,
        if set { format!("{env_var} is set") } else { format!("{env_var} is not set") },
    );
    if !set {
        *all_passed = false;
    }
}

fn check_mcp_servers(config: &Config) {
    let count = config.mcp.servers.len();
    print_check(
        "MCP servers configured",
        true,
        if count == 0 { "none".into() } else { format!("{count} server(s)") },
    );
}

// ── Formatting helper ─────────────────────────────────────────────────

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}
