//! Per-evidence audit pack: JSON, LaTeX, and PDF reports.

use std::path::Path;
use std::process::Command;

use printpdf::{BuiltinFont, Mm, PdfDocument};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::anomaly::{self, Anomaly, RiskStatus};
use crate::error::{CustodyError, OptionExt as _, Result, ResultExt as _};
use crate::ledger::{LedgerMeta, LedgerStore};
use crate::mirror::{MirrorRecord, MirrorStore};
use crate::model::{CustodyTransfer, EvidenceRecord};
use crate::util;
use crate::verify::ChainStatus;

pub const AUDIT_PACK_FORMAT: &str = "custody-audit-pack-v1";

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPackManifest {
    pub format: String,
    pub generated_at_utc: String,
    pub ledger: LedgerMeta,
    pub evidence_id: String,
    pub case_id: String,
    pub evidence_digest: String,
    /// Linkage id of the registration block on the evidence chain.
    pub linkage_id: String,
    pub chains: Vec<ChainStatus>,
    pub transfer_count: usize,
    pub anomaly_count: usize,
    pub unresolved_count: usize,
    pub risk_score: u32,
    pub status: RiskStatus,
    pub notes: Vec<String>,
}

impl AuditPackManifest {
    pub fn chains_intact(&self) -> bool {
        self.chains.iter().all(|c| c.intact)
    }
}

/// Everything that goes into one pack, gathered up front.
#[derive(Debug, Clone)]
pub struct AuditPackContents {
    pub manifest: AuditPackManifest,
    pub record: EvidenceRecord,
    pub timeline: Vec<CustodyTransfer>,
    pub anomalies: Vec<Anomaly>,
    /// Mirror summary rows for every block that references the item.
    pub transactions: Vec<MirrorRecord>,
}

/// Collect the pack contents for one evidence item. The record and the
/// timeline come from the ledger; findings and transaction summaries come
/// from the mirror.
pub fn collect_audit_pack<M>(
    ledgers: &LedgerStore,
    mirror: &M,
    evidence_id: &str,
) -> Result<AuditPackContents>
where
    M: MirrorStore + ?Sized,
{
    util::validate_identifier(evidence_id, "evidence id")?;
    let (block, record) = ledgers
        .evidence_record(evidence_id)?
        .required_input(&format!("evidence '{evidence_id}' is not on the ledger"))?;
    let timeline = ledgers.custody_timeline(evidence_id)?;
    let anomalies = mirror.anomalies(evidence_id, None)?;
    let transactions = mirror.transaction_summaries(evidence_id)?;
    let chains = ledgers.status()?;
    let risk_score = anomaly::risk_score(&anomalies);

    let mut notes = vec!["Offline audit pack: JSON + LaTeX + PDF.".to_string()];
    if chains.iter().any(|c| !c.intact) {
        notes.push("WARNING: at least one ledger chain failed verification.".to_string());
    }

    let manifest = AuditPackManifest {
        format: AUDIT_PACK_FORMAT.to_string(),
        generated_at_utc: util::now_utc_rfc3339(),
        ledger: ledgers.meta().clone(),
        evidence_id: record.evidence_id.clone(),
        case_id: record.case_id.clone(),
        evidence_digest: record.evidence_digest.clone(),
        linkage_id: block.linkage_id,
        chains,
        transfer_count: timeline.len(),
        anomaly_count: anomalies.len(),
        unresolved_count: anomalies.iter().filter(|a| !a.is_resolved()).count(),
        risk_score,
        status: RiskStatus::from_score(risk_score),
        notes,
    };
    Ok(AuditPackContents {
        manifest,
        record,
        timeline,
        anomalies,
        transactions,
    })
}

// ---------------------------------------------------------------------------
// Audit pack writer
// ---------------------------------------------------------------------------

pub fn write_audit_pack(out_dir: &Path, pack: &AuditPackContents) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| CustodyError::Report(format!("create out dir {}: {e}", out_dir.display())))?;

    write_json(out_dir, "manifest.json", &pack.manifest)?;
    write_json(out_dir, "evidence_record.json", &pack.record)?;
    write_json(out_dir, "custody_timeline.json", &pack.timeline)?;
    write_json(out_dir, "anomaly_report.json", &pack.anomalies)?;
    write_json(out_dir, "ledger_transactions.json", &pack.transactions)?;

    let tex = render_latex_report(pack);
    write_file(out_dir, "audit_report.tex", tex.as_bytes())?;

    let pdf = build_audit_pdf(pack)?;
    write_file(out_dir, "audit_report.pdf", &pdf)?;

    let xmp = build_xmp_metadata(&pack.manifest);
    write_file(out_dir, "audit_report.xmp", xmp.as_bytes())?;

    // Best-effort typeset PDF, if tectonic is installed.
    if let Err(e) = try_compile_pdf_with_tectonic(out_dir) {
        debug!(error = %e, "tectonic unavailable; keeping built-in PDF");
    }

    info!(
        evidence_id = %pack.manifest.evidence_id,
        out_dir = %out_dir.display(),
        "audit pack written"
    );
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(out_dir: &Path, name: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).ctx_report(&format!("serialize {name}"))?;
    write_file(out_dir, name, &bytes)
}

fn write_file(out_dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let path = out_dir.join(name);
    std::fs::write(&path, bytes)
        .map_err(|e| CustodyError::Report(format!("write {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// LaTeX report
// ---------------------------------------------------------------------------

fn escape_tex(s: &str) -> String {
    s.replace('\\', "\\textbackslash{}")
        .replace('&', "\\&")
        .replace('%', "\\%")
        .replace('$', "\\$")
        .replace('#', "\\#")
        .replace('_', "\\_")
        .replace('{', "\\{")
        .replace('}', "\\}")
        .replace('~', "\\textasciitilde{}")
        .replace('^', "\\textasciicircum{}")
}

pub fn render_latex_report(pack: &AuditPackContents) -> String {
    let m = &pack.manifest;
    let mut out = String::new();
    out.push_str(
        r#"\documentclass[11pt]{article}
\usepackage[a4paper,margin=1in]{geometry}
\usepackage{longtable}
\usepackage{hyperref}
\begin{document}
"#,
    );
    out.push_str(&format!(
        "\\section*{{Chain of Custody Audit Report}}\\noindent Generated at (UTC): {}\\\\\n",
        escape_tex(&m.generated_at_utc)
    ));
    out.push_str(&format!("Evidence ID: {}\\\\\n", escape_tex(&m.evidence_id)));
    out.push_str(&format!("Case ID: {}\\\\\n", escape_tex(&m.case_id)));
    out.push_str(&format!(
        "Digest (SHA-256): \\texttt{{{}}}\\\\\n",
        escape_tex(&m.evidence_digest)
    ));
    out.push_str(&format!(
        "Ledger ID: {}\\\\\n",
        escape_tex(&m.ledger.ledger_id.to_string())
    ));
    out.push_str(&format!(
        "Ledger chains intact: {}\\\\\n",
        if m.chains_intact() { "yes" } else { "NO" }
    ));
    out.push_str(&format!(
        "Risk score: {} ({:?})\\\\\n",
        m.risk_score, m.status
    ));
    out.push_str(&format!(
        "Software: custody v{}\\\\\n",
        escape_tex(util::VERSION)
    ));

    out.push_str("\\subsection*{Custody timeline}\n");
    out.push_str(
        r#"\begin{longtable}{r l l l l}
\textbf{\#} & \textbf{When (UTC)} & \textbf{From} & \textbf{To} & \textbf{Type}\\ \hline
"#,
    );
    for (i, t) in pack.timeline.iter().enumerate() {
        out.push_str(&format!(
            "{} & {} & {} & {} & {}\\\\\n",
            i,
            escape_tex(&util::format_rfc3339(t.transferred_at)),
            escape_tex(&t.from_user),
            escape_tex(&t.to_user),
            escape_tex(&t.transfer_type)
        ));
    }
    out.push_str("\\end{longtable}\n");

    out.push_str("\\subsection*{Anomalies}\n");
    if pack.anomalies.is_empty() {
        out.push_str("None recorded.\n");
    } else {
        out.push_str(
            r#"\begin{longtable}{l l l l}
\textbf{Type} & \textbf{Severity} & \textbf{Title} & \textbf{Resolved}\\ \hline
"#,
        );
        for a in &pack.anomalies {
            out.push_str(&format!(
                "{} & {} & {} & {}\\\\\n",
                escape_tex(a.anomaly_type.as_str()),
                a.severity.as_str(),
                escape_tex(&a.title),
                a.resolution
                    .as_ref()
                    .map(|r| escape_tex(&r.resolved_by))
                    .unwrap_or_else(|| "no".to_string())
            ));
        }
        out.push_str("\\end{longtable}\n");
    }
    out.push_str("\\end{document}\n");
    out
}

fn try_compile_pdf_with_tectonic(out_dir: &Path) -> Result<()> {
    let status = Command::new("tectonic")
        .arg("audit_report.tex")
        .current_dir(out_dir)
        .status()
        .ctx_report("invoke tectonic")?;
    if !status.success() {
        return Err(CustodyError::Report(format!(
            "tectonic failed with status {status}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PrintPDF-based PDF generation (fallback when tectonic unavailable)
// ---------------------------------------------------------------------------

fn build_audit_pdf(pack: &AuditPackContents) -> Result<Vec<u8>> {
    let lines = build_pdf_lines(pack);
    let (doc, page1, layer1) =
        PdfDocument::new("Chain of Custody Audit Report", Mm(210.0), Mm(297.0), "Layer 1");
    let font_regular = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .ctx_report("load PDF font")?;
    let font_bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .ctx_report("load PDF font")?;

    let mut layer = doc.get_page(page1).get_layer(layer1);
    let mut y = 280.0_f64;
    let x = 15.0_f64;
    let line_height = 6.0_f64;

    for (bold, size, text) in lines {
        if y < 20.0 {
            let (new_page, new_layer) = doc.add_page(Mm(210.0), Mm(297.0), "Layer");
            layer = doc.get_page(new_page).get_layer(new_layer);
            y = 280.0;
        }
        let font = if bold { &font_bold } else { &font_regular };
        layer.use_text(text, size, Mm(x), Mm(y), font);
        y -= line_height;
    }

    let mut buffer = Vec::new();
    {
        let mut writer = std::io::BufWriter::new(&mut buffer);
        doc.save(&mut writer).ctx_report("render PDF")?;
    }
    Ok(buffer)
}

fn build_pdf_lines(pack: &AuditPackContents) -> Vec<(bool, f64, String)> {
    let m = &pack.manifest;
    let mut lines: Vec<(bool, f64, String)> = Vec::new();
    lines.push((true, 16.0, "Chain of Custody Audit Report".to_string()));
    lines.push((false, 10.0, String::new()));
    lines.push((false, 10.0, format!("Generated: {}", m.generated_at_utc)));
    lines.push((false, 10.0, format!("Evidence ID: {}", m.evidence_id)));
    lines.push((false, 10.0, format!("Case ID: {}", m.case_id)));
    lines.push((false, 10.0, format!("Digest: {}", m.evidence_digest)));
    lines.push((false, 10.0, format!("Ledger ID: {}", m.ledger.ledger_id)));
    for c in &m.chains {
        lines.push((
            false,
            10.0,
            format!(
                "Chain {} ({}): {} blocks, {}",
                c.chain_id,
                c.role,
                c.block_count,
                match c.broken_at {
                    None => "intact".to_string(),
                    Some(at) => format!("BROKEN at block {at}"),
                }
            ),
        ));
    }
    lines.push((false, 10.0, format!("Risk score: {} ({:?})", m.risk_score, m.status)));
    lines.push((false, 10.0, format!("Software: custody v{}", util::VERSION)));
    lines.push((false, 10.0, String::new()));

    lines.push((true, 12.0, "Custody timeline".to_string()));
    lines.push((true, 9.0, format!("{:<4} {:<26} {:<22} {}", "#", "When (UTC)", "From", "To")));
    for (i, t) in pack.timeline.iter().enumerate() {
        lines.push((
            false,
            9.0,
            format!(
                "{:<4} {:<26} {:<22} {}",
                i,
                util::format_rfc3339(t.transferred_at),
                truncate_str(&t.from_user, 20),
                truncate_str(&t.to_user, 20)
            ),
        ));
    }
    lines.push((false, 10.0, String::new()));

    lines.push((true, 12.0, "Anomalies".to_string()));
    if pack.anomalies.is_empty() {
        lines.push((false, 9.0, "None recorded.".to_string()));
    }
    for a in &pack.anomalies {
        let state = if a.is_resolved() { "resolved" } else { "open" };
        lines.push((
            false,
            9.0,
            format!(
                "[{}] {:<20} {} ({state})",
                a.severity.as_str(),
                a.anomaly_type.as_str(),
                truncate_str(&a.title, 48)
            ),
        ));
    }

    lines.push((false, 10.0, String::new()));
    lines.push((
        false,
        8.0,
        "Generated by custody. Ledger linkage can be verified offline.".to_string(),
    ));
    lines
}

fn build_xmp_metadata(manifest: &AuditPackManifest) -> String {
    format!(
        r#"<?xpacket begin=" " id="W5M0MpCehiHzreSzNTczkc9d"?>
<x:xmpmeta xmlns:x="adobe:ns:meta/">
  <rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
    <rdf:Description rdf:about=""
        xmlns:pdfaid="http://www.aiim.org/pdfa/ns/id/"
        xmlns:dc="http://purl.org/dc/elements/1.1/"
        xmlns:xmp="http://ns.adobe.com/xap/1.0/">
      <pdfaid:part>2</pdfaid:part>
      <pdfaid:conformance>B</pdfaid:conformance>
      <dc:title>
        <rdf:Alt>
          <rdf:li xml:lang="x-default">Chain of Custody Audit Report {evidence}</rdf:li>
        </rdf:Alt>
      </dc:title>
      <xmp:CreatorTool>custody</xmp:CreatorTool>
      <xmp:CreateDate>{ts}</xmp:CreateDate>
      <xmp:ModifyDate>{ts}</xmp:ModifyDate>
    </rdf:Description>
  </rdf:RDF>
</x:xmpmeta>
<?xpacket end="w"?>"#,
        evidence = manifest.evidence_id,
        ts = manifest.generated_at_utc,
    )
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
