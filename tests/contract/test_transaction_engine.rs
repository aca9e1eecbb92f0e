//! Contract Tests for the Transaction Engine
//!
//! Send a command, wait for one of several patterns, retry on timeout.
//! Covers the retry law, buffer accumulation across attempts, match
//! precedence, leftover handling and cancellation.

use std::time::Duration;

use fwpilot::session::testing::{Reply, ScriptedHost, StaticProber};
use fwpilot::session::{Session, SessionFactory};
use fwpilot::transaction::{self, MatchMode, Pattern, TransactionOutcome};
use fwpilot::{Error, Transaction};

const PROMPT: &str = "[root@node ~]#";
const FLASH: &str = "/usr/bin/sas3flash -c 0 -f /usr/imgs/hba/3008IT14.ROM";

async fn connect(host: &ScriptedHost) -> Session {
    host.connector(StaticProber::reachable())
        .connect()
        .await
        .expect("connect")
}

fn flash_tx(attempts: u32) -> Transaction {
    Transaction::new(FLASH)
        .expect_exact("Successfully")
        .timeout(Duration::from_secs(60))
        .attempts(attempts)
}

#[tokio::test(start_paused = true)]
async fn test_match_on_third_attempt_reports_two_retries() {
    let host = ScriptedHost::new(PROMPT, "pw").on(
        "sas3flash",
        [
            Reply::Silence,
            Reply::Silence,
            Reply::prompted("Finished Processing Commands Successfully."),
        ],
    );
    let mut session = connect(&host).await;

    let result = session.execute(&flash_tx(3)).await.expect("third attempt matches");
    assert_eq!(result.outcome, TransactionOutcome::Success);
    assert_eq!(result.retries, 2);
    assert_eq!(result.matched, Some(0));
    assert_eq!(result.matched_text.as_deref(), Some("Successfully"));
    assert_eq!(host.count_sent("sas3flash"), 3);
    // The buffer kept all three echoes
    assert_eq!(result.raw.matches(FLASH).count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_budget_exhausted_reports_retries_and_partial() {
    let host = ScriptedHost::new(PROMPT, "pw").on(
        "sas3flash",
        [
            Reply::Silence,
            Reply::Silence,
            Reply::prompted("Finished Processing Commands Successfully."),
        ],
    );
    let mut session = connect(&host).await;

    let err = session.execute(&flash_tx(2)).await.unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(err.partial_output().map(|p| p.matches(FLASH).count()), Some(2));
    match err {
        Error::Timeout {
            command, retries, ..
        } => {
            assert_eq!(command, FLASH);
            assert_eq!(retries, 1);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(host.count_sent("sas3flash"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_match_straddles_attempts() {
    let host = ScriptedHost::new(PROMPT, "pw").without_echo().on(
        "sas3flash",
        [
            Reply::output("Finished Processing Comm"),
            Reply::output("ands Successfully.\r\n"),
        ],
    );
    let mut session = connect(&host).await;

    let tx = Transaction::new(FLASH)
        .expect_exact("Commands Successfully")
        .timeout(Duration::from_secs(5))
        .attempts(2);
    let result = session.execute(&tx).await.expect("match across attempts");
    assert_eq!(result.retries, 1);
    assert_eq!(result.raw, "Finished Processing Commands Successfully");
}

#[tokio::test(start_paused = true)]
async fn test_earliest_match_wins() {
    let host = ScriptedHost::new(PROMPT, "pw").on(
        "UpdateBmc",
        [Reply::prompted("Error: flash busy\r\nUpdate Complete")],
    );
    let mut session = connect(&host).await;

    let tx = Transaction::new("sumtool -c UpdateBmc --file bmc.bin")
        .expect_exact("Update Complete")
        .expect_regex(r"(?i)error")
        .unwrap();
    let result = session.execute(&tx).await.unwrap();
    assert_eq!(result.matched, Some(1));
    assert_eq!(result.matched_text.as_deref(), Some("Error"));
}

#[tokio::test(start_paused = true)]
async fn test_tie_goes_to_first_listed() {
    let host = ScriptedHost::new(PROMPT, "pw").on("mlxup", [Reply::prompted("Done.")]);
    let mut session = connect(&host).await;

    let tx = Transaction::new("mlxup -i fw.bin -f -u")
        .expect_regex(r"Don\w")
        .unwrap()
        .expect_exact("Done");
    let result = session.execute(&tx).await.unwrap();
    assert_eq!(result.matched, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_leftover_is_visible_to_expect() {
    let host = ScriptedHost::new(PROMPT, "pw").on(
        "mcuupdate",
        [Reply::prompted("stage 1 ok\r\nstage 2 ok")],
    );
    let mut session = connect(&host).await;

    let tx = Transaction::new("ipmicfg -tp mcuupdate mcu.bin").expect_exact("stage 1 ok");
    session.execute(&tx).await.unwrap();

    let seen = transaction::expect(
        &mut session,
        &[Pattern::exact("stage 2 ok")],
        Duration::from_secs(1),
    )
    .await
    .expect("leftover still buffered");
    assert_eq!(seen.index, 0);
    assert!(seen.raw.ends_with("stage 2 ok"));
    assert!(!seen.raw.contains("stage 1 ok"));
}

#[tokio::test(start_paused = true)]
async fn test_execute_discards_stale_output() {
    let host = ScriptedHost::new(PROMPT, "pw")
        .on("mcuupdate", [Reply::prompted("stage 1 ok\r\nstage 2 ok")])
        .on("sync", [Reply::Silence]);
    let mut session = connect(&host).await;

    let tx = Transaction::new("ipmicfg -tp mcuupdate mcu.bin").expect_exact("stage 1 ok");
    session.execute(&tx).await.unwrap();

    // "stage 2 ok" was left over from the previous command
    let tx = Transaction::new("sync")
        .expect_exact("stage 2 ok")
        .timeout(Duration::from_secs(2));
    let err = session.execute(&tx).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { retries: 0, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_prompt_pattern_and_body() {
    let host = ScriptedHost::new(PROMPT, "pw").on(
        "redhat-release",
        [Reply::prompted("CentOS Linux release 7.4.1708 (Core)")],
    );
    let mut session = connect(&host).await;

    let result = session
        .execute(&Transaction::new("cat /etc/redhat-release").expect_prompt())
        .await
        .unwrap();
    assert!(result.is_success());
    assert!(!result.output.contains(PROMPT));
    assert_eq!(result.body(), "CentOS Linux release 7.4.1708 (Core)");
}

#[tokio::test(start_paused = true)]
async fn test_escape_sequences_are_stripped_before_matching() {
    let host = ScriptedHost::new(PROMPT, "pw")
        .on("selftest", [Reply::prompted("\x1b[1;32mPASS\x1b[0m")]);
    let mut session = connect(&host).await;

    let result = session
        .execute(&Transaction::new("selftest").expect_exact("PASS"))
        .await
        .unwrap();
    assert_eq!(result.matched_text.as_deref(), Some("PASS"));
    assert!(!result.raw.contains('\x1b'));
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget() {
    let host = ScriptedHost::new(PROMPT, "pw");
    let mut session = connect(&host).await;

    let tx = Transaction::new("cd /usr/bin");
    assert!(tx.is_fire_and_forget());
    let result = session.execute(&tx).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.matched, None);
    assert_eq!(result.retries, 0);
    assert_eq!(host.count_sent("cd /usr/bin"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tolerant_execute_reports_timeout_as_outcome() {
    let host = ScriptedHost::new(PROMPT, "pw").on("reboot", [Reply::Silence]);
    let mut session = connect(&host).await;

    let tx = Transaction::new("reboot -f")
        .expect_exact("Rebooting.")
        .timeout(Duration::from_secs(30));
    let result = transaction::execute_tolerant(&mut session, &tx).await.unwrap();
    assert_eq!(result.outcome, TransactionOutcome::TimedOut);
    assert!(!result.is_success());
    assert!(result.raw.contains("reboot -f"));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_wait() {
    let host = ScriptedHost::new(PROMPT, "pw").on("UpdateBios", [Reply::Silence]);
    let mut session = connect(&host).await;

    let token = session.cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    });

    let tx = Transaction::new("sumtool -c UpdateBios --file bios.bin")
        .expect_exact("WARNING")
        .timeout(Duration::from_secs(800))
        .attempts(3);
    let err = session.execute(&tx).await.unwrap_err();
    match err {
        Error::Cancelled { command } => assert!(command.contains("UpdateBios")),
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert_eq!(host.count_sent("UpdateBios"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_per_transaction_token() {
    let host = ScriptedHost::new(PROMPT, "pw").on("mlxup", [Reply::Silence]);
    let mut session = connect(&host).await;

    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let tx = Transaction::new("mlxup -query")
        .expect_prompt()
        .cancel_with(token);
    let err = session.execute(&tx).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
    // The session's own token is untouched
    assert!(!session.cancellation().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_regex_mode_expectations() {
    let host = ScriptedHost::new(PROMPT, "pw")
        .on("-listall", [Reply::prompted("0  SAS3008(C0)  14.00.00.00  0e.01.00.07")]);
    let mut session = connect(&host).await;

    let tx = Transaction::new("sas3flash -listall")
        .expect_all([r"ERROR", r"SAS\d{4}\(C\d\)\s+\d+\.\d+"], MatchMode::Regex)
        .unwrap();
    let result = session.execute(&tx).await.unwrap();
    assert_eq!(result.matched, Some(1));
    assert_eq!(result.matched_text.as_deref(), Some("SAS3008(C0)  14.00"));

    let invalid = Transaction::new("x").expect_all(["(unclosed"], MatchMode::Regex);
    assert!(invalid.is_err());
}
