//! Backend endpoint table and the item keys screens cache them under.

use crate::store::FetchRequest;

#[derive(Debug, Clone)]
pub struct Resource {
  /// Item key; resources scoped to a parent append the parent id
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  /// Path relative to the API base; `{id}` is replaced by the parent id
  pub path: &'static str,
  pub description: &'static str,
}

/// All list endpoints the dashboard screens read from
pub const RESOURCES: &[Resource] = &[
  Resource {
    name: "clients",
    aliases: &["client", "c"],
    path: "/api/clients",
    description: "Customer accounts",
  },
  Resource {
    name: "produits",
    aliases: &["products", "produit"],
    path: "/api/produits",
    description: "Product catalogue",
  },
  Resource {
    name: "stocks",
    aliases: &["stock", "inventory"],
    path: "/api/stocks",
    description: "Stock levels per warehouse",
  },
  Resource {
    name: "ventes",
    aliases: &["sales", "vente"],
    path: "/api/ventes",
    description: "Sales",
  },
  Resource {
    name: "caisses",
    aliases: &["registers", "caisse"],
    path: "/api/caisses",
    description: "Cash registers",
  },
  Resource {
    name: "caisse_mouvements",
    aliases: &["register-movements", "mouvements"],
    path: "/api/caisses/{id}/mouvements",
    description: "Movements of one cash register",
  },
  Resource {
    name: "transactions",
    aliases: &["tx"],
    path: "/api/transactions",
    description: "Cash transactions",
  },
  Resource {
    name: "imports",
    aliases: &["orders", "commandes"],
    path: "/api/imports",
    description: "Imports and supplier orders",
  },
  Resource {
    name: "proformas",
    aliases: &["proforma", "quotes"],
    path: "/api/proformas",
    description: "Proforma invoices",
  },
  Resource {
    name: "vehicules",
    aliases: &["vehicles", "vehicule"],
    path: "/api/vehicules",
    description: "Fleet vehicles",
  },
  Resource {
    name: "vehicule_depenses",
    aliases: &["vehicle-expenses"],
    path: "/api/vehicules/{id}/depenses",
    description: "Expenses of one vehicle",
  },
  Resource {
    name: "depenses",
    aliases: &["expenses", "depense"],
    path: "/api/depenses",
    description: "General expenses",
  },
];

impl Resource {
  /// Whether the path needs a parent id.
  pub fn is_scoped(&self) -> bool {
    self.path.contains("{id}")
  }

  /// Key the fetched collection is cached under, e.g. `vehicule_depenses12`.
  pub fn item_key(&self, id: Option<&str>) -> String {
    match id {
      Some(id) if self.is_scoped() => format!("{}{}", self.name, id),
      _ => self.name.to_string(),
    }
  }

  /// Concrete path, or `None` when a scoped resource is missing its id or the
  /// id cannot name a single path segment (empty, `.` or `..`).
  pub fn path_for(&self, id: Option<&str>) -> Option<String> {
    match (self.is_scoped(), id) {
      (true, Some(id)) => Some(self.path.replace("{id}", &encode_segment(id)?)),
      (true, None) => None,
      (false, _) => Some(self.path.to_string()),
    }
  }

  /// Build the list request a screen would dispatch for this resource.
  pub fn request(&self, id: Option<&str>) -> Option<FetchRequest> {
    let path = self.path_for(id)?;
    Some(FetchRequest::new(path, self.item_key(id)))
  }
}

/// Percent-encode `id` so it stays inside one path segment.
fn encode_segment(id: &str) -> Option<String> {
  if matches!(id, "" | "." | "..") {
    return None;
  }
  // form encoding turns spaces into '+'; a literal '+' is already %2B here
  Some(url::form_urlencoded::byte_serialize(id.as_bytes()).collect::<String>().replace('+', "%20"))
}

/// Resolve user input to a resource.
///
/// Exact name or alias wins, then a unique prefix match.
pub fn lookup(input: &str) -> Option<&'static Resource> {
  let input = input.trim().to_lowercase();
  if input.is_empty() {
    return None;
  }

  if let Some(found) = RESOURCES
    .iter()
    .find(|r| r.name == input || r.aliases.contains(&input.as_str()))
  {
    return Some(found);
  }

  let mut prefixed = RESOURCES.iter().filter(|r| {
    r.name.starts_with(&input) || r.aliases.iter().any(|a| a.starts_with(&input))
  });

  match (prefixed.next(), prefixed.next()) {
    (Some(only), None) => Some(only),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exact_match() {
    assert_eq!(lookup("clients").map(|r| r.name), Some("clients"));
  }

  #[test]
  fn test_alias_match() {
    assert_eq!(lookup("expenses").map(|r| r.name), Some("depenses"));
    assert_eq!(lookup("Vehicles").map(|r| r.name), Some("vehicules"));
  }

  #[test]
  fn test_unique_prefix_match() {
    assert_eq!(lookup("prof").map(|r| r.name), Some("proformas"));
  }

  #[test]
  fn test_ambiguous_prefix_rejected() {
    // vehicules and vehicule_depenses
    assert!(lookup("vehicule_").is_some());
    assert!(lookup("veh").is_none());
  }

  #[test]
  fn test_scoped_resource_key_and_path() {
    let res = lookup("vehicule_depenses").unwrap();
    assert!(res.is_scoped());
    assert_eq!(res.item_key(Some("12")), "vehicule_depenses12");
    assert_eq!(
      res.path_for(Some("12")).as_deref(),
      Some("/api/vehicules/12/depenses")
    );
    assert!(res.request(None).is_none());
  }

  #[test]
  fn test_scoped_id_is_one_encoded_segment() {
    let res = lookup("caisse_mouvements").unwrap();
    assert_eq!(
      res.path_for(Some("../x")).as_deref(),
      Some("/api/caisses/..%2Fx/mouvements")
    );
    assert_eq!(
      res.path_for(Some("a?b#c")).as_deref(),
      Some("/api/caisses/a%3Fb%23c/mouvements")
    );
    assert_eq!(
      res.path_for(Some("a b+c")).as_deref(),
      Some("/api/caisses/a%20b%2Bc/mouvements")
    );
  }

  #[test]
  fn test_scoped_id_rejects_dot_segments() {
    let res = lookup("vehicule_depenses").unwrap();
    assert!(res.path_for(Some("")).is_none());
    assert!(res.path_for(Some(".")).is_none());
    assert!(res.request(Some("..")).is_none());
  }

  #[test]
  fn test_unscoped_ignores_id() {
    let res = lookup("clients").unwrap();
    let request = res.request(Some("7")).unwrap();
    assert_eq!(request.item_key, "clients");
    assert_eq!(request.url, "/api/clients");
  }

  #[test]
  fn test_names_are_unique() {
    let mut names: Vec<_> = RESOURCES.iter().map(|r| r.name).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), RESOURCES.len());
  }
}
