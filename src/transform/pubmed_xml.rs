use std::collections::BTreeSet;
use std::sync::OnceLock;

use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use tracing::{debug, warn};

use crate::entities::publication::Publication;
use crate::error::PubTrialsError;

const CLINICALTRIALS_GOV: &str = "ClinicalTrials.gov";

type XmlReader<'a> = Reader<&'a [u8]>;

fn nct_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^NCT\d{8}$").expect("NCT id regex is valid"))
}

fn medline_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})\b").expect("medline year regex is valid"))
}

/// Normalizes a ClinicalTrials.gov accession (`nct 0123 4567` → `NCT01234567`).
pub fn normalize_trial_id(raw: &str) -> Option<String> {
    let compact = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    nct_id_re().is_match(&compact).then_some(compact)
}

fn year_from_medline_date(value: &str) -> Option<i32> {
    medline_year_re()
        .captures(value)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn unexpected_eof(tag: &[u8]) -> PubTrialsError {
    PubTrialsError::Xml(format!(
        "unexpected end of document inside <{}>",
        String::from_utf8_lossy(tag)
    ))
}

/// Concatenated text content of the current element, flattening inline markup.
fn read_text(reader: &mut XmlReader<'_>, tag: &[u8]) -> Result<String, PubTrialsError> {
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut depth = 1usize;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Text(e) => {
                let value = e
                    .unescape()
                    .map_err(|err| PubTrialsError::Xml(err.to_string()))?;
                text.push_str(&value);
            }
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e)),
            Event::Eof => return Err(unexpected_eof(tag)),
            _ => {}
        }
        buf.clear();
    }

    Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
}

#[derive(Debug, Default)]
struct ArticleDraft {
    pmid: String,
    title: Option<String>,
    year: Option<i32>,
    medline_date: Option<String>,
    publication_types: BTreeSet<String>,
    trial_ids: BTreeSet<String>,
}

impl ArticleDraft {
    fn finish(self) -> Option<Publication> {
        if self.pmid.is_empty() {
            warn!("Skipping PubmedArticle without a PMID");
            return None;
        }
        let pub_year = self
            .year
            .or_else(|| self.medline_date.as_deref().and_then(year_from_medline_date));
        Some(Publication {
            pmid: self.pmid,
            title: self.title.filter(|v| !v.is_empty()),
            pub_year,
            publication_types: self.publication_types,
            trial_ids: self.trial_ids,
            available: true,
        })
    }
}

/// Parses every `PubmedArticle` in an efetch response.
///
/// Book records are skipped. Absent lists yield empty sets, never errors.
pub fn parse_article_set(xml: &str) -> Result<Vec<Publication>, PubTrialsError> {
    let mut reader = Reader::from_str(xml);
    let mut publications = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"PubmedArticle" => {
                    if let Some(publication) = parse_pubmed_article(&mut reader)? {
                        publications.push(publication);
                    }
                }
                b"PubmedBookArticle" => debug!("Skipping PubmedBookArticle record"),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(publications)
}

fn parse_pubmed_article(reader: &mut XmlReader<'_>) -> Result<Option<Publication>, PubTrialsError> {
    let mut draft = ArticleDraft::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"MedlineCitation" => {
                parse_medline_citation(reader, &mut draft)?;
            }
            Event::End(e) if e.name().as_ref() == b"PubmedArticle" => break,
            Event::Eof => return Err(unexpected_eof(b"PubmedArticle")),
            _ => {}
        }
        buf.clear();
    }

    Ok(draft.finish())
}

fn parse_medline_citation(
    reader: &mut XmlReader<'_>,
    draft: &mut ArticleDraft,
) -> Result<(), PubTrialsError> {
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                // CommentsCorrections carry PMIDs of other records; the first one is ours.
                b"PMID" if draft.pmid.is_empty() => draft.pmid = read_text(reader, b"PMID")?,
                b"Article" => parse_article(reader, draft)?,
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"MedlineCitation" => break,
            Event::Eof => return Err(unexpected_eof(b"MedlineCitation")),
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

fn parse_article(reader: &mut XmlReader<'_>, draft: &mut ArticleDraft) -> Result<(), PubTrialsError> {
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"Journal" => parse_journal(reader, draft)?,
                b"ArticleTitle" => draft.title = Some(read_text(reader, b"ArticleTitle")?),
                b"PublicationTypeList" => {
                    draft.publication_types = parse_publication_types(reader)?;
                }
                b"DataBankList" => draft.trial_ids = parse_databank_list(reader)?,
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"Article" => break,
            Event::Eof => return Err(unexpected_eof(b"Article")),
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

fn parse_journal(reader: &mut XmlReader<'_>, draft: &mut ArticleDraft) -> Result<(), PubTrialsError> {
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"PubDate" => parse_pub_date(reader, draft)?,
            Event::End(e) if e.name().as_ref() == b"Journal" => break,
            Event::Eof => return Err(unexpected_eof(b"Journal")),
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

fn parse_pub_date(reader: &mut XmlReader<'_>, draft: &mut ArticleDraft) -> Result<(), PubTrialsError> {
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"Year" => draft.year = read_text(reader, b"Year")?.parse().ok(),
                b"MedlineDate" => draft.medline_date = Some(read_text(reader, b"MedlineDate")?),
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"PubDate" => break,
            Event::Eof => return Err(unexpected_eof(b"PubDate")),
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

fn parse_publication_types(reader: &mut XmlReader<'_>) -> Result<BTreeSet<String>, PubTrialsError> {
    let mut types = BTreeSet::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"PublicationType" => {
                let value = read_text(reader, b"PublicationType")?;
                if !value.is_empty() {
                    types.insert(value);
                }
            }
            Event::End(e) if e.name().as_ref() == b"PublicationTypeList" => break,
            Event::Eof => return Err(unexpected_eof(b"PublicationTypeList")),
            _ => {}
        }
        buf.clear();
    }

    Ok(types)
}

fn parse_databank_list(reader: &mut XmlReader<'_>) -> Result<BTreeSet<String>, PubTrialsError> {
    let mut trial_ids = BTreeSet::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"DataBank" => {
                let (name, accessions) = parse_databank(reader)?;
                let accessions = if name.eq_ignore_ascii_case(CLINICALTRIALS_GOV) {
                    accessions
                } else {
                    Vec::new()
                };
                for accession in accessions {
                    match normalize_trial_id(&accession) {
                        Some(id) => {
                            trial_ids.insert(id);
                        }
                        None => debug!(accession, "Dropping malformed ClinicalTrials.gov accession"),
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"DataBankList" => break,
            Event::Eof => return Err(unexpected_eof(b"DataBankList")),
            _ => {}
        }
        buf.clear();
    }

    Ok(trial_ids)
}

fn parse_databank(reader: &mut XmlReader<'_>) -> Result<(String, Vec<String>), PubTrialsError> {
    let mut name = String::new();
    let mut accessions = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"DataBankName" => name = read_text(reader, b"DataBankName")?,
                b"AccessionNumber" => accessions.push(read_text(reader, b"AccessionNumber")?),
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"DataBank" => break,
            Event::Eof => return Err(unexpected_eof(b"DataBank")),
            _ => {}
        }
        buf.clear();
    }

    Ok((name, accessions))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIAL_ARTICLE: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE PubmedArticleSet PUBLIC "-//NLM//DTD PubMedArticle, 1st January 2019//EN" "https://dtd.nlm.nih.gov/ncbi/pubmed/out/pubmed_190101.dtd">
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE" Owner="NLM">
      <PMID Version="1">22663011</PMID>
      <Article PubModel="Print-Electronic">
        <Journal>
          <JournalIssue CitedMedium="Internet">
            <Volume>367</Volume>
            <PubDate><Year>2012</Year><Month>Jul</Month><Day>12</Day></PubDate>
          </JournalIssue>
          <Title>The New England journal of medicine</Title>
        </Journal>
        <ArticleTitle>Improved survival with <i>MEK</i> inhibition &amp; BRAF-mutated melanoma.</ArticleTitle>
        <DataBankList CompleteYN="Y">
          <DataBank>
            <DataBankName>ClinicalTrials.gov</DataBankName>
            <AccessionNumberList>
              <AccessionNumber>NCT01245062</AccessionNumber>
              <AccessionNumber>nct 0124 5063</AccessionNumber>
              <AccessionNumber>NCT01245062</AccessionNumber>
            </AccessionNumberList>
          </DataBank>
          <DataBank>
            <DataBankName>GENBANK</DataBankName>
            <AccessionNumberList>
              <AccessionNumber>AB123456</AccessionNumber>
            </AccessionNumberList>
          </DataBank>
        </DataBankList>
        <PublicationTypeList>
          <PublicationType UI="D017427">Clinical Trial, Phase III</PublicationType>
          <PublicationType UI="D016449">Randomized Controlled Trial</PublicationType>
          <PublicationType UI="D016449">Randomized Controlled Trial</PublicationType>
        </PublicationTypeList>
      </Article>
      <CommentsCorrectionsList>
        <CommentsCorrections RefType="CommentIn">
          <RefSource>N Engl J Med. 2012 Jul 12;367(2):171-2</RefSource>
          <PMID Version="1">22663012</PMID>
        </CommentsCorrections>
      </CommentsCorrectionsList>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="pubmed">22663011</ArticleId>
      </ArticleIdList>
    </PubmedData>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn parses_trial_ids_year_types_and_title() {
        let pubs = parse_article_set(TRIAL_ARTICLE).unwrap();
        assert_eq!(pubs.len(), 1);
        let p = &pubs[0];
        assert_eq!(p.pmid, "22663011");
        assert_eq!(
            p.title.as_deref(),
            Some("Improved survival with MEK inhibition & BRAF-mutated melanoma.")
        );
        assert_eq!(p.pub_year, Some(2012));
        assert_eq!(
            p.trial_ids.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["NCT01245062", "NCT01245063"]
        );
        assert_eq!(
            p.publication_types.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["Clinical Trial, Phase III", "Randomized Controlled Trial"]
        );
        assert!(p.available);
    }

    #[test]
    fn record_without_databank_has_empty_trial_ids() {
        let xml = r#"<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID>11111111</PMID>
      <Article>
        <Journal><JournalIssue><PubDate><MedlineDate>1998 Dec-1999 Jan</MedlineDate></PubDate></JournalIssue></Journal>
        <ArticleTitle>No registry here</ArticleTitle>
      </Article>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;
        let pubs = parse_article_set(xml).unwrap();
        assert_eq!(pubs.len(), 1);
        assert!(pubs[0].trial_ids.is_empty());
        assert!(pubs[0].publication_types.is_empty());
        assert_eq!(pubs[0].pub_year, Some(1998));
    }

    #[test]
    fn empty_databank_list_is_not_an_error() {
        let xml = r#"<PubmedArticleSet><PubmedArticle><MedlineCitation>
<PMID>22222222</PMID><Article><DataBankList/><PublicationTypeList></PublicationTypeList></Article>
</MedlineCitation></PubmedArticle></PubmedArticleSet>"#;
        let pubs = parse_article_set(xml).unwrap();
        assert_eq!(pubs.len(), 1);
        assert!(pubs[0].trial_ids.is_empty());
        assert_eq!(pubs[0].title, None);
        assert_eq!(pubs[0].pub_year, None);
    }

    #[test]
    fn parses_multiple_articles_in_order_and_skips_books() {
        let xml = r#"<PubmedArticleSet>
<PubmedArticle><MedlineCitation><PMID>3</PMID><Article><ArticleTitle>c</ArticleTitle></Article></MedlineCitation></PubmedArticle>
<PubmedBookArticle><BookDocument><PMID>9</PMID></BookDocument></PubmedBookArticle>
<PubmedArticle><MedlineCitation><PMID>1</PMID><Article><ArticleTitle>a</ArticleTitle></Article></MedlineCitation></PubmedArticle>
</PubmedArticleSet>"#;
        let pubs = parse_article_set(xml).unwrap();
        assert_eq!(
            pubs.iter().map(|p| p.pmid.as_str()).collect::<Vec<_>>(),
            vec!["3", "1"]
        );
    }

    #[test]
    fn truncated_document_is_an_error() {
        let xml = "<PubmedArticleSet><PubmedArticle><MedlineCitation><PMID>1</PMID>";
        assert!(matches!(
            parse_article_set(xml),
            Err(PubTrialsError::Xml(_))
        ));
    }

    #[test]
    fn normalize_trial_id_validates_pattern() {
        assert_eq!(normalize_trial_id("NCT00000102").as_deref(), Some("NCT00000102"));
        assert_eq!(normalize_trial_id(" nct00000102 ").as_deref(), Some("NCT00000102"));
        assert_eq!(normalize_trial_id("NCT0000010"), None);
        assert_eq!(normalize_trial_id("ISRCTN12345678"), None);
    }
}
