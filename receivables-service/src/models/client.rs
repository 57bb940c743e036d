//! Client model for receivables-service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::Invoice;

/// Client record. Owns zero or more invoices.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Client {
    pub client_id: Uuid,
    pub firstname: String,
    pub lastname: String,
    pub company_name: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub business_phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub address: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl Client {
    pub fn is_live(&self) -> bool {
        self.deleted_utc.is_none()
    }
}

/// A live client together with its live invoices, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct ClientWithInvoices {
    #[serde(flatten)]
    pub client: Client,
    pub invoices: Vec<Invoice>,
}

/// Input for creating a client.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateClient {
    #[validate(length(min = 1, max = 255, message = "Firstname is required"))]
    pub firstname: String,
    #[validate(length(min = 1, max = 255, message = "Lastname is required"))]
    pub lastname: String,
    #[validate(length(min = 1, max = 255, message = "Company name is required"))]
    pub company_name: String,
    #[validate(email(message = "Must be a valid e-mail"))]
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub business_phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub address: Option<String>,
}

/// Input for updating a client. Company names are held to a stricter minimum here.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateClient {
    #[validate(length(min = 1, max = 255, message = "Firstname is required"))]
    pub firstname: String,
    #[validate(length(min = 1, max = 255, message = "Lastname is required"))]
    pub lastname: String,
    #[validate(length(
        min = 3,
        max = 255,
        message = "Company name must be between 3 and 255 characters"
    ))]
    pub company_name: String,
    #[validate(email(message = "Must be a valid e-mail"))]
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub business_phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub address: Option<String>,
}

/// Column values written for a client, shared by create and update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDetails {
    pub firstname: String,
    pub lastname: String,
    pub company_name: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub business_phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub address: Option<String>,
}

/// Blank optional strings are stored as NULL.
fn blank_to_none(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl CreateClient {
    /// Drop blank optional fields so an empty e-mail is not validated as an address.
    pub fn normalized(self) -> Self {
        Self {
            email: blank_to_none(self.email),
            phone_number: blank_to_none(self.phone_number),
            business_phone: blank_to_none(self.business_phone),
            mobile_phone: blank_to_none(self.mobile_phone),
            address: blank_to_none(self.address),
            ..self
        }
    }
}

impl UpdateClient {
    pub fn normalized(self) -> Self {
        Self {
            email: blank_to_none(self.email),
            phone_number: blank_to_none(self.phone_number),
            business_phone: blank_to_none(self.business_phone),
            mobile_phone: blank_to_none(self.mobile_phone),
            address: blank_to_none(self.address),
            ..self
        }
    }
}

impl From<CreateClient> for ClientDetails {
    fn from(input: CreateClient) -> Self {
        Self {
            firstname: input.firstname,
            lastname: input.lastname,
            company_name: input.company_name,
            email: input.email,
            phone_number: input.phone_number,
            business_phone: input.business_phone,
            mobile_phone: input.mobile_phone,
            address: input.address,
        }
    }
}

impl From<UpdateClient> for ClientDetails {
    fn from(input: UpdateClient) -> Self {
        Self {
            firstname: input.firstname,
            lastname: input.lastname,
            company_name: input.company_name,
            email: input.email,
            phone_number: input.phone_number,
            business_phone: input.business_phone,
            mobile_phone: input.mobile_phone,
            address: input.address,
        }
    }
}

/// One page of search results plus the total number of matches.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> CreateClient {
        CreateClient {
            firstname: "Ada".to_string(),
            lastname: "Lovelace".to_string(),
            company_name: "Analytical Engines".to_string(),
            email: Some("ada@example.com".to_string()),
            phone_number: None,
            business_phone: None,
            mobile_phone: None,
            address: None,
        }
    }

    #[test]
    fn valid_client_passes() {
        assert!(input().validate().is_ok());
    }

    #[test]
    fn empty_email_is_treated_as_absent() {
        let client = CreateClient {
            email: Some("  ".to_string()),
            ..input()
        }
        .normalized();
        assert!(client.email.is_none());
        assert!(client.validate().is_ok());
    }

    #[test]
    fn malformed_email_is_rejected() {
        let client = CreateClient {
            email: Some("not-an-address".to_string()),
            ..input()
        };
        assert!(client.validate().is_err());
    }

    #[test]
    fn update_requires_three_character_company_name() {
        let update = UpdateClient {
            firstname: "Ada".to_string(),
            lastname: "Lovelace".to_string(),
            company_name: "AE".to_string(),
            email: None,
            phone_number: None,
            business_phone: None,
            mobile_phone: None,
            address: None,
        };
        let errors = update.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("company_name"));
    }
}
