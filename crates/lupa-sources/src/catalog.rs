use std::collections::BTreeSet;

use crate::types::{Capability, Source, SourceFamily};

fn declare(
    id: &str,
    family: SourceFamily,
    capabilities: &[Capability],
    base_endpoint: &str,
    priority: u32,
    region: &str,
) -> Source {
    Source {
        id: id.to_string(),
        family,
        capabilities: BTreeSet::from_iter(capabilities.iter().copied()),
        base_endpoint: base_endpoint.to_string(),
        priority,
        region: region.to_string(),
    }
}

/// The built-in source table. Declared once at startup; demo mode keeps the
/// same catalog and swaps only the fetch adapter.
pub fn builtin_catalog() -> Vec<Source> {
    use Capability::*;
    use SourceFamily::*;

    vec![
        declare(
            "portal-transparencia",
            Federal,
            &[Contracts, Expenses, Servants, Sanctions, Agreements],
            "https://api.portaldatransparencia.gov.br/api-de-dados",
            1,
            "",
        ),
        declare(
            "compras-gov",
            Federal,
            &[Contracts, Biddings],
            "https://compras.dados.gov.br",
            2,
            "",
        ),
        declare(
            "transferegov",
            Federal,
            &[Agreements, Expenses],
            "https://api.transferegov.gestao.gov.br",
            2,
            "",
        ),
        declare(
            "pncp",
            Federal,
            &[Contracts, Biddings],
            "https://pncp.gov.br/api/consulta",
            2,
            "",
        ),
        declare(
            "dados-gov",
            Portal,
            &[Geographic, HealthData, EducationData, Expenses],
            "https://dados.gov.br/api",
            3,
            "",
        ),
        declare(
            "datasus",
            Federal,
            &[HealthData],
            "https://apidadosabertos.saude.gov.br",
            2,
            "",
        ),
        declare(
            "inep-dados",
            Federal,
            &[EducationData],
            "https://dadosabertos.inep.gov.br/api",
            2,
            "",
        ),
        declare(
            "ibge-localidades",
            Federal,
            &[Geographic],
            "https://servicodados.ibge.gov.br/api/v1",
            2,
            "",
        ),
        declare(
            "ceis-sancoes",
            Federal,
            &[Sanctions],
            "https://api.portaldatransparencia.gov.br/api-de-dados/ceis",
            2,
            "",
        ),
        declare(
            "sp-transparencia",
            State,
            &[Contracts, Expenses, Servants],
            "https://www.transparencia.sp.gov.br/api",
            3,
            "SP",
        ),
        declare(
            "rj-transparencia",
            State,
            &[Contracts, Expenses],
            "https://transparencia.rj.gov.br/api",
            3,
            "RJ",
        ),
        declare(
            "mg-transparencia",
            State,
            &[Contracts, Expenses, Servants],
            "https://transparencia.mg.gov.br/api",
            3,
            "MG",
        ),
        declare(
            "rs-transparencia",
            State,
            &[Contracts, Expenses],
            "https://transparencia.rs.gov.br/api",
            3,
            "RS",
        ),
        declare(
            "tce-sp",
            Tce,
            &[Biddings, Contracts],
            "https://transparencia.tce.sp.gov.br/api",
            4,
            "SP",
        ),
        declare(
            "tce-mg",
            Tce,
            &[Biddings, Contracts],
            "https://dadosabertos.tce.mg.gov.br/api",
            4,
            "MG",
        ),
        declare(
            "tce-rs",
            Tce,
            &[Biddings, Contracts, Expenses],
            "https://dados.tce.rs.gov.br/api",
            4,
            "RS",
        ),
        declare(
            "ckan-recife",
            Portal,
            &[Expenses, Geographic],
            "https://dados.recife.pe.gov.br/api",
            5,
            "PE",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::builtin_catalog;
    use crate::types::Capability;

    #[test]
    fn unit_catalog_declares_at_least_fifteen_sources_with_unique_ids() {
        let catalog = builtin_catalog();
        assert!(catalog.len() >= 15, "got {}", catalog.len());
        let mut ids: Vec<&str> = catalog.iter().map(|source| source.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), catalog.len(), "duplicate source ids");
    }

    #[test]
    fn unit_catalog_covers_every_capability() {
        let catalog = builtin_catalog();
        for capability in [
            Capability::Contracts,
            Capability::Servants,
            Capability::Expenses,
            Capability::Biddings,
            Capability::Geographic,
            Capability::HealthData,
            Capability::EducationData,
            Capability::Sanctions,
            Capability::Agreements,
        ] {
            assert!(
                catalog.iter().any(|source| source.advertises(capability)),
                "no source advertises {}",
                capability.as_str()
            );
        }
    }

    #[test]
    fn unit_catalog_sources_have_endpoints_and_priorities() {
        for source in builtin_catalog() {
            assert!(source.base_endpoint.starts_with("https://"), "{}", source.id);
            assert!(source.priority >= 1, "{}", source.id);
        }
    }
}
