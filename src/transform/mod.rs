pub mod pubmed_xml;
