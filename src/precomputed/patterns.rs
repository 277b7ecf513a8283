//! Built-in intent patterns and the personal-data denylist.
//!
//! Patterns run against normalized (lower-cased, whitespace-collapsed) text
//! in table order; the first match wins, so more specific intents come
//! before catch-alls like greetings.

use once_cell::sync::Lazy;
use regex::Regex;

pub const PRICING: &str = "pricing_response";
pub const DISCOUNTS: &str = "discount_response";
pub const PAYMENT: &str = "payment_methods_response";
pub const SHIPPING: &str = "shipping_response";
pub const WARRANTY: &str = "warranty_response";
pub const HOURS: &str = "business_hours_response";
pub const CONTACT: &str = "contact_response";
pub const PRODUCT_INFO: &str = "product_info_response";
pub const THANKS: &str = "thanks_response";
pub const FAREWELL: &str = "farewell_response";
pub const GREETING: &str = "greeting_response";

#[derive(Debug)]
pub struct IntentPattern {
    pub category: &'static str,
    pub regex: Regex,
}

fn pattern(category: &'static str, re: &str) -> IntentPattern {
    IntentPattern {
        category,
        regex: Regex::new(re).unwrap(),
    }
}

pub static DEFAULT_PATTERNS: Lazy<Vec<IntentPattern>> = Lazy::new(|| {
    vec![
        pattern(
            PRICING,
            r"\b(cu[aá]nto (cuesta|vale|sale|cobran)|precios?|costos?|tarifas?|how much|prices?|pricing|cost)\b",
        ),
        pattern(
            DISCOUNTS,
            r"\b(descuentos?|ofertas?|promoci[oó]n(es)?|rebajas?|cupones?|discounts?|promos?|promotions?|coupons?)\b",
        ),
        pattern(
            PAYMENT,
            r"\b(formas? de pago|m[eé]todos? de pago|pagar con|aceptan tarjeta|transferencia|efectivo|payment methods?|pay with|credit cards?|paypal)\b",
        ),
        pattern(
            SHIPPING,
            r"\b(env[ií]os?|env[ií]an|entregas?|despachos?|shipping|delivery|deliver)\b",
        ),
        pattern(
            WARRANTY,
            r"\b(garant[ií]as?|devoluci[oó]n(es)?|reembolsos?|warranty|guarantee|returns?|refunds?)\b",
        ),
        pattern(
            HOURS,
            r"\b(horarios?|a qu[eé] hora|abren|cierran|opening hours|business hours|what time do you (open|close))\b",
        ),
        pattern(
            CONTACT,
            r"\b(tel[eé]fono de contacto|contactarlos|contacto|whatsapp|contact|phone number|customer service)\b",
        ),
        pattern(
            PRODUCT_INFO,
            r"\b(caracter[ií]sticas|especificaciones|qu[eé] incluye|informaci[oó]n del producto|features|specs|specifications|product info(rmation)?)\b",
        ),
        pattern(THANKS, r"\b(gracias|thanks|thank you|thx)\b"),
        pattern(
            FAREWELL,
            r"\b(adi[oó]s|hasta luego|hasta pronto|chao|chau|nos vemos|bye|goodbye|see you)\b",
        ),
        pattern(
            GREETING,
            r"^(hola|buenas|buenos d[ií]as|buenas (tardes|noches)|hello|hi|hey|good (morning|afternoon|evening))\b",
        ),
    ]
});

/// Phrases that mark a message or reply as personal. Matched case-insensitively
/// as substrings.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "mi nombre",
    "me llamo",
    "my name",
    "mi pedido",
    "my order",
    "numero de pedido",
    "número de pedido",
    "order number",
    "mi cuenta",
    "my account",
    "contraseña",
    "password",
    "numero de tarjeta",
    "número de tarjeta",
    "card number",
    "cvv",
    "mi direccion",
    "mi dirección",
    "my address",
    "mi telefono",
    "mi teléfono",
    "my phone",
    "cedula",
    "cédula",
    "pasaporte",
    "passport",
    "social security",
    "@",
];

/// Six or more consecutive digits: phone, card or document numbers.
pub static LONG_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{6,}").unwrap());

/// `{name}` together with a leading comma or space, for when no name is known.
pub static NAME_PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[,\s]*\{name\}").unwrap());

/// First category whose pattern matches already-normalized text.
pub fn classify_normalized(text: &str) -> Option<&'static str> {
    DEFAULT_PATTERNS
        .iter()
        .find(|p| p.regex.is_match(text))
        .map(|p| p.category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(DEFAULT_PATTERNS.len(), 11);
    }

    #[test]
    fn test_spanish_and_english_intents() {
        let cases = [
            ("cuanto cuesta", PRICING),
            ("cuánto vale el plan premium", PRICING),
            ("what is the price", PRICING),
            ("tienen descuentos", DISCOUNTS),
            ("cuales son las formas de pago", PAYMENT),
            ("hacen envíos a lima", SHIPPING),
            ("do you offer shipping", SHIPPING),
            ("tiene garantía", WARRANTY),
            ("cual es el horario", HOURS),
            ("what are your business hours", HOURS),
            ("tienen whatsapp", CONTACT),
            ("que incluye el paquete", PRODUCT_INFO),
            ("muchas gracias", THANKS),
            ("hasta luego", FAREWELL),
            ("hola", GREETING),
            ("good morning!", GREETING),
        ];
        for (text, expected) in cases {
            assert_eq!(classify_normalized(text), Some(expected), "text: {}", text);
        }
    }

    #[test]
    fn test_specific_intent_beats_greeting() {
        assert_eq!(classify_normalized("hola, cuanto cuesta?"), Some(PRICING));
    }

    #[test]
    fn test_unmatched_text() {
        assert_eq!(classify_normalized("me interesa saber mas"), None);
        assert_eq!(classify_normalized("this is fine"), None);
    }

    #[test]
    fn test_name_placeholder_removal() {
        assert_eq!(
            NAME_PLACEHOLDER_RE.replace_all("Hola {name}, bienvenido", ""),
            "Hola, bienvenido"
        );
        assert_eq!(
            NAME_PLACEHOLDER_RE.replace_all("¡Gracias, {name}!", ""),
            "¡Gracias!"
        );
    }
}
